//! Backend configuration.
//!
//! [`BackendConfig`] is the flat record read from a config file or assembled
//! from CLI flags. It carries the parameters of every backend kind; only the
//! fields relevant to the selected kind are handed to its adapter (see
//! [`crate::backend::BackendSpec`]).
//!
//! ```toml
//! backend = "consul"
//! nodes = ["10.0.0.5:8500"]
//! scheme = "https"
//! client_ca_keys = "/etc/ssl/consul-ca.pem"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{BackendError, Result};

/// The closed set of supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Etcd,
    Etcdv3,
    Consul,
    Zookeeper,
    Rancher,
    Redis,
    Env,
    File,
    Vault,
    Dynamodb,
    Ssm,
}

impl BackendKind {
    /// Kind used when the configuration does not name one.
    pub const DEFAULT: BackendKind = BackendKind::Etcd;

    /// Every supported kind, in registry order.
    pub const ALL: [BackendKind; 11] = [
        BackendKind::Etcd,
        BackendKind::Etcdv3,
        BackendKind::Consul,
        BackendKind::Zookeeper,
        BackendKind::Rancher,
        BackendKind::Redis,
        BackendKind::Env,
        BackendKind::File,
        BackendKind::Vault,
        BackendKind::Dynamodb,
        BackendKind::Ssm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Etcd => "etcd",
            BackendKind::Etcdv3 => "etcdv3",
            BackendKind::Consul => "consul",
            BackendKind::Zookeeper => "zookeeper",
            BackendKind::Rancher => "rancher",
            BackendKind::Redis => "redis",
            BackendKind::Env => "env",
            BackendKind::File => "file",
            BackendKind::Vault => "vault",
            BackendKind::Dynamodb => "dynamodb",
            BackendKind::Ssm => "ssm",
        }
    }

    /// Node list used when none is configured. Vault has no default address.
    pub fn default_nodes(&self) -> Vec<String> {
        let node = match self {
            BackendKind::Etcd | BackendKind::Etcdv3 => "http://127.0.0.1:2379",
            BackendKind::Consul => "127.0.0.1:8500",
            BackendKind::Zookeeper => "127.0.0.1:2181",
            BackendKind::Redis => "127.0.0.1:6379",
            BackendKind::Rancher => "http://rancher-metadata",
            BackendKind::Env
            | BackendKind::File
            | BackendKind::Vault
            | BackendKind::Dynamodb
            | BackendKind::Ssm => return Vec::new(),
        };
        vec![node.to_string()]
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        BackendKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| BackendError::InvalidBackend(s.to_string()))
    }
}

/// Vault authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    Token,
    AppId,
    Approle,
    Userpass,
    Cert,
    Kubernetes,
    Github,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Token => "token",
            AuthType::AppId => "app-id",
            AuthType::Approle => "approle",
            AuthType::Userpass => "userpass",
            AuthType::Cert => "cert",
            AuthType::Kubernetes => "kubernetes",
            AuthType::Github => "github",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "token" => Ok(AuthType::Token),
            "app-id" => Ok(AuthType::AppId),
            "approle" => Ok(AuthType::Approle),
            "userpass" => Ok(AuthType::Userpass),
            "cert" => Ok(AuthType::Cert),
            "kubernetes" => Ok(AuthType::Kubernetes),
            "github" => Ok(AuthType::Github),
            other => Err(BackendError::InvalidConfig(format!(
                "Unknown vault auth type: {}. Use 'token', 'app-id', 'approle', 'userpass', 'cert', 'kubernetes' or 'github'",
                other
            ))),
        }
    }
}

/// Backend configuration record.
///
/// Not every field is meaningful for every kind; unused fields are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend kind identifier; `etcd` when absent
    pub backend: Option<String>,

    /// Backend nodes (addresses or URLs, transport specific)
    pub nodes: Vec<String>,

    /// URL scheme for nodes given without one
    pub scheme: String,

    /// Client certificate (PEM)
    pub client_cert: Option<PathBuf>,

    /// Client private key (PEM)
    pub client_key: Option<PathBuf>,

    /// CA bundle used to verify the backend (PEM)
    pub client_ca_keys: Option<PathBuf>,

    /// Skip server certificate verification
    pub client_insecure: bool,

    /// Send HTTP basic auth with `username` / `password`
    pub basic_auth: bool,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Vault auth method
    pub auth_type: Option<String>,

    pub app_id: Option<String>,
    pub user_id: Option<String>,
    /// Approle role id, or the role for kubernetes auth
    pub role_id: Option<String>,
    pub secret_id: Option<String>,

    /// Vault token (token and github auth)
    pub auth_token: Option<String>,

    /// Vault auth mount path; defaults to the auth method name
    pub path: Option<String>,

    /// Static files or directories (file backend)
    pub files: Vec<PathBuf>,

    /// Glob applied to file names found in directories (file backend)
    pub filter: String,

    /// Key separator (redis backend)
    pub separator: String,

    /// Table name (dynamodb backend)
    pub table: Option<String>,

    /// Poll period for backends without change notification
    pub poll_interval_ms: u64,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_filter() -> String {
    "*".to_string()
}

fn default_separator() -> String {
    "/".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend: None,
            nodes: Vec::new(),
            scheme: default_scheme(),
            client_cert: None,
            client_key: None,
            client_ca_keys: None,
            client_insecure: false,
            basic_auth: false,
            username: None,
            password: None,
            auth_type: None,
            app_id: None,
            user_id: None,
            role_id: None,
            secret_id: None,
            auth_token: None,
            path: None,
            files: Vec::new(),
            filter: default_filter(),
            separator: default_separator(),
            table: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl BackendConfig {
    /// Create a configuration for the given kind with all other fields defaulted.
    pub fn for_kind(kind: BackendKind) -> Self {
        Self {
            backend: Some(kind.to_string()),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| BackendError::InvalidConfig(format!("Invalid config file: {}", e)))
    }

    /// Resolve the backend kind, applying the default when none is set.
    ///
    /// This is the only place the default kind is applied.
    pub fn kind(&self) -> Result<BackendKind> {
        match self.backend.as_deref().map(str::trim) {
            None | Some("") => Ok(BackendKind::DEFAULT),
            Some(name) => name.parse(),
        }
    }

    /// Configured nodes, or the kind's default nodes when none are set.
    pub fn nodes_for(&self, kind: BackendKind) -> Vec<String> {
        if self.nodes.is_empty() {
            kind.default_nodes()
        } else {
            self.nodes.clone()
        }
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind() {
        let err = "bogus".parse::<BackendKind>().unwrap_err();
        assert!(matches!(err, BackendError::InvalidBackend(name) if name == "bogus"));
        assert!("Etcd".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_missing_kind_defaults_to_etcd() {
        let config = BackendConfig::default();
        assert_eq!(config.kind().unwrap(), BackendKind::Etcd);

        let config = BackendConfig {
            backend: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(config.kind().unwrap(), BackendKind::Etcd);
    }

    #[test]
    fn test_default_nodes() {
        let config = BackendConfig::default();
        assert_eq!(
            config.nodes_for(BackendKind::Consul),
            vec!["127.0.0.1:8500".to_string()]
        );
        assert!(config.nodes_for(BackendKind::Vault).is_empty());

        let config = BackendConfig {
            nodes: vec!["10.0.0.1:8500".into()],
            ..Default::default()
        };
        assert_eq!(config.nodes_for(BackendKind::Consul), vec!["10.0.0.1:8500"]);
    }

    #[test]
    fn test_from_toml() {
        let config = BackendConfig::from_toml(
            r#"
backend = "file"
files = ["/etc/app.yaml"]
filter = "*.yaml"
"#,
        )
        .unwrap();
        assert_eq!(config.kind().unwrap(), BackendKind::File);
        assert_eq!(config.files, vec![PathBuf::from("/etc/app.yaml")]);
        assert_eq!(config.filter, "*.yaml");
        assert_eq!(config.separator, "/");
        assert_eq!(config.poll_interval_ms, 1000);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        let err = BackendConfig::from_toml("nodes = 5").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_auth_type_parse() {
        assert_eq!("app-id".parse::<AuthType>().unwrap(), AuthType::AppId);
        assert_eq!("approle".parse::<AuthType>().unwrap(), AuthType::Approle);
        assert!("ldap".parse::<AuthType>().is_err());
    }
}
