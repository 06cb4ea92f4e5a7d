//! Backend selection.
//!
//! [`BackendSpec`] narrows a flat [`BackendConfig`] to the parameters one
//! backend kind needs, then builds the adapter.

use std::path::PathBuf;
use std::time::Duration;

use crate::backends::{
    ConsulParams, ConsulStore, EnvParams, EnvStore, EtcdParams, EtcdStore, EtcdV3Store,
    FileParams, FileStore, RancherParams, RancherStore, VaultAuth, VaultParams, VaultStore,
    ZookeeperParams, ZookeeperStore,
};
use crate::config::{AuthType, BackendConfig, BackendKind};
use crate::error::{BackendError, Result};
use crate::http::{BasicAuth, TlsSettings};
use crate::traits::StoreClient;

#[cfg(feature = "aws")]
use crate::backends::{DynamoDbParams, DynamoDbStore, SsmParams, SsmStore};
#[cfg(feature = "redis")]
use crate::backends::{RedisParams, RedisStore};

/// One variant per backend kind, carrying only that kind's parameters.
#[derive(Debug, Clone)]
pub enum BackendSpec {
    Etcd(EtcdParams),
    Etcdv3 {
        etcd: EtcdParams,
        poll_interval: Duration,
    },
    Consul(ConsulParams),
    Zookeeper(ZookeeperParams),
    Rancher(RancherParams),
    #[cfg(feature = "redis")]
    Redis(RedisParams),
    Env(EnvParams),
    File(FileParams),
    Vault(VaultParams),
    #[cfg(feature = "aws")]
    Dynamodb(DynamoDbParams),
    #[cfg(feature = "aws")]
    Ssm(SsmParams),
}

impl BackendSpec {
    /// Pick the variant for the configured kind (etcd when unset).
    pub fn select(config: &BackendConfig) -> Result<Self> {
        let kind = config.kind()?;
        let nodes = config.nodes_for(kind);
        let poll_interval = config.poll_interval();

        let spec = match kind {
            BackendKind::Etcd => BackendSpec::Etcd(etcd_params(config, nodes)),
            BackendKind::Etcdv3 => BackendSpec::Etcdv3 {
                etcd: etcd_params(config, nodes),
                poll_interval,
            },
            BackendKind::Consul => BackendSpec::Consul(ConsulParams {
                nodes,
                scheme: config.scheme.clone(),
                tls: tls_settings(config),
                basic_auth: basic_auth(config),
            }),
            BackendKind::Zookeeper => BackendSpec::Zookeeper(ZookeeperParams {
                nodes,
                poll_interval,
            }),
            BackendKind::Rancher => BackendSpec::Rancher(RancherParams {
                nodes,
                poll_interval,
            }),
            #[cfg(feature = "redis")]
            BackendKind::Redis => BackendSpec::Redis(RedisParams {
                nodes,
                password: redis_password(config),
                separator: config.separator.clone(),
            }),
            #[cfg(not(feature = "redis"))]
            BackendKind::Redis => return Err(feature_required(kind, "redis")),
            BackendKind::Env => BackendSpec::Env(EnvParams { poll_interval }),
            BackendKind::File => BackendSpec::File(FileParams {
                files: config.files.clone(),
                filter: config.filter.clone(),
                poll_interval,
            }),
            BackendKind::Vault => BackendSpec::Vault(VaultParams {
                nodes,
                scheme: config.scheme.clone(),
                tls: tls_settings(config),
                auth: vault_auth(config)?,
                mount: config.path.clone(),
                poll_interval,
            }),
            #[cfg(feature = "aws")]
            BackendKind::Dynamodb => BackendSpec::Dynamodb(DynamoDbParams {
                table: required(config.table.as_ref(), kind, "table")?,
                endpoint: nodes.into_iter().next(),
                poll_interval,
            }),
            #[cfg(feature = "aws")]
            BackendKind::Ssm => BackendSpec::Ssm(SsmParams { poll_interval }),
            #[cfg(not(feature = "aws"))]
            BackendKind::Dynamodb | BackendKind::Ssm => {
                return Err(feature_required(kind, "aws"))
            }
        };

        Ok(spec)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendSpec::Etcd(_) => BackendKind::Etcd,
            BackendSpec::Etcdv3 { .. } => BackendKind::Etcdv3,
            BackendSpec::Consul(_) => BackendKind::Consul,
            BackendSpec::Zookeeper(_) => BackendKind::Zookeeper,
            BackendSpec::Rancher(_) => BackendKind::Rancher,
            #[cfg(feature = "redis")]
            BackendSpec::Redis(_) => BackendKind::Redis,
            BackendSpec::Env(_) => BackendKind::Env,
            BackendSpec::File(_) => BackendKind::File,
            BackendSpec::Vault(_) => BackendKind::Vault,
            #[cfg(feature = "aws")]
            BackendSpec::Dynamodb(_) => BackendKind::Dynamodb,
            #[cfg(feature = "aws")]
            BackendSpec::Ssm(_) => BackendKind::Ssm,
        }
    }

    /// Build the adapter. Errors are returned as the adapter reports them.
    pub async fn connect(self) -> Result<Box<dyn StoreClient>> {
        let store: Box<dyn StoreClient> = match self {
            BackendSpec::Etcd(params) => Box::new(EtcdStore::new(params)?),
            BackendSpec::Etcdv3 {
                etcd,
                poll_interval,
            } => Box::new(EtcdV3Store::new(etcd, poll_interval)?),
            BackendSpec::Consul(params) => Box::new(ConsulStore::new(params)?),
            BackendSpec::Zookeeper(params) => Box::new(ZookeeperStore::connect(params).await?),
            BackendSpec::Rancher(params) => Box::new(RancherStore::new(params)?),
            #[cfg(feature = "redis")]
            BackendSpec::Redis(params) => Box::new(RedisStore::connect(params).await?),
            BackendSpec::Env(params) => Box::new(EnvStore::new(params)),
            BackendSpec::File(params) => Box::new(FileStore::new(params)?),
            BackendSpec::Vault(params) => Box::new(VaultStore::connect(params).await?),
            #[cfg(feature = "aws")]
            BackendSpec::Dynamodb(params) => Box::new(DynamoDbStore::connect(params).await?),
            #[cfg(feature = "aws")]
            BackendSpec::Ssm(params) => Box::new(SsmStore::connect(params).await?),
        };
        Ok(store)
    }
}

fn etcd_params(config: &BackendConfig, nodes: Vec<String>) -> EtcdParams {
    EtcdParams {
        nodes,
        scheme: config.scheme.clone(),
        tls: tls_settings(config),
        basic_auth: basic_auth(config),
    }
}

fn tls_settings(config: &BackendConfig) -> TlsSettings {
    TlsSettings {
        client_cert: config.client_cert.clone(),
        client_key: config.client_key.clone(),
        ca_cert: config.client_ca_keys.clone(),
        insecure: config.client_insecure,
    }
}

fn basic_auth(config: &BackendConfig) -> Option<BasicAuth> {
    config.basic_auth.then(|| BasicAuth {
        username: config.username.clone().unwrap_or_default(),
        password: config.password.clone().unwrap_or_default(),
    })
}

fn required(value: Option<&String>, backend: BackendKind, field: &'static str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => Err(BackendError::MissingField { backend, field }),
    }
}

fn vault_auth(config: &BackendConfig) -> Result<VaultAuth> {
    let vault = BackendKind::Vault;
    let auth_type: AuthType = required(config.auth_type.as_ref(), vault, "auth_type")?.parse()?;

    let auth = match auth_type {
        AuthType::Token => VaultAuth::Token(required(config.auth_token.as_ref(), vault, "auth_token")?),
        AuthType::AppId => VaultAuth::AppId {
            app_id: required(config.app_id.as_ref(), vault, "app_id")?,
            user_id: required(config.user_id.as_ref(), vault, "user_id")?,
        },
        AuthType::Approle => VaultAuth::AppRole {
            role_id: required(config.role_id.as_ref(), vault, "role_id")?,
            secret_id: required(config.secret_id.as_ref(), vault, "secret_id")?,
        },
        AuthType::Userpass => VaultAuth::Userpass {
            username: required(config.username.as_ref(), vault, "username")?,
            password: required(config.password.as_ref(), vault, "password")?,
        },
        AuthType::Cert => {
            if config.client_cert.is_none() || config.client_key.is_none() {
                return Err(BackendError::MissingField {
                    backend: vault,
                    field: "client_cert",
                });
            }
            VaultAuth::Cert
        }
        AuthType::Kubernetes => VaultAuth::Kubernetes {
            role: required(config.role_id.as_ref(), vault, "role_id")?,
            jwt_path: PathBuf::from(crate::backends::vault::KUBERNETES_JWT_PATH),
        },
        AuthType::Github => VaultAuth::Github {
            token: required(config.auth_token.as_ref(), vault, "auth_token")?,
        },
    };

    Ok(auth)
}

/// Redis secret: `password`, else the `client_key` setting used as the
/// secret by older configs.
#[cfg(feature = "redis")]
fn redis_password(config: &BackendConfig) -> Option<String> {
    config.password.clone().or_else(|| {
        config
            .client_key
            .as_ref()
            .map(|key| key.to_string_lossy().into_owned())
    })
}

#[cfg(any(not(feature = "redis"), not(feature = "aws")))]
fn feature_required(kind: BackendKind, feature: &str) -> BackendError {
    BackendError::InvalidConfig(format!(
        "{} backend requires the '{}' feature",
        kind, feature
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: &str) -> BackendConfig {
        BackendConfig {
            backend: Some(kind.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_every_kind_maps_back() {
        for kind in BackendKind::ALL {
            let mut cfg = BackendConfig::for_kind(kind);
            cfg.files = vec![PathBuf::from("/etc")];
            cfg.auth_type = Some("token".into());
            cfg.auth_token = Some("t".into());
            cfg.table = Some("config".into());

            match BackendSpec::select(&cfg) {
                Ok(spec) => assert_eq!(spec.kind(), kind),
                Err(e) => assert!(e.is_config_error(), "{}: {}", kind, e),
            }
        }
    }

    #[test]
    fn test_default_kind_is_etcd_with_default_node() {
        let spec = BackendSpec::select(&BackendConfig::default()).unwrap();
        let BackendSpec::Etcd(params) = spec else {
            panic!("expected etcd");
        };
        assert_eq!(params.nodes, vec!["http://127.0.0.1:2379".to_string()]);
    }

    #[test]
    fn test_unknown_kind() {
        let err = BackendSpec::select(&config("bogus")).unwrap_err();
        assert!(matches!(err, BackendError::InvalidBackend(ref name) if name == "bogus"));
    }

    #[test]
    fn test_vault_requires_auth_type() {
        let err = BackendSpec::select(&config("vault")).unwrap_err();
        assert!(matches!(
            err,
            BackendError::MissingField { field: "auth_type", .. }
        ));
    }

    #[test]
    fn test_vault_auth_secrets() {
        let mut cfg = config("vault");
        cfg.auth_type = Some("approle".into());
        cfg.role_id = Some("r".into());
        let err = BackendSpec::select(&cfg).unwrap_err();
        assert!(matches!(
            err,
            BackendError::MissingField { field: "secret_id", .. }
        ));

        cfg.secret_id = Some("s".into());
        cfg.path = Some("custom-approle".into());
        let BackendSpec::Vault(params) = BackendSpec::select(&cfg).unwrap() else {
            panic!("expected vault");
        };
        assert_eq!(params.auth.auth_type(), AuthType::Approle);
        assert_eq!(params.mount.as_deref(), Some("custom-approle"));
        assert!(params.nodes.is_empty());
    }

    #[test]
    fn test_vault_unknown_auth_type() {
        let mut cfg = config("vault");
        cfg.auth_type = Some("ldap".into());
        let err = BackendSpec::select(&cfg).unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
    }

    #[test]
    fn test_basic_auth_only_when_enabled() {
        let mut cfg = config("consul");
        cfg.username = Some("u".into());
        cfg.password = Some("p".into());
        let BackendSpec::Consul(params) = BackendSpec::select(&cfg).unwrap() else {
            panic!("expected consul");
        };
        assert!(params.basic_auth.is_none());

        cfg.basic_auth = true;
        let BackendSpec::Consul(params) = BackendSpec::select(&cfg).unwrap() else {
            panic!("expected consul");
        };
        assert_eq!(params.basic_auth.unwrap().username, "u");
    }

    #[cfg(feature = "aws")]
    #[test]
    fn test_dynamodb_requires_table() {
        let err = BackendSpec::select(&config("dynamodb")).unwrap_err();
        assert!(matches!(
            err,
            BackendError::MissingField { field: "table", .. }
        ));
    }

    #[cfg(feature = "redis")]
    #[test]
    fn test_redis_params() {
        let mut cfg = config("redis");
        cfg.separator = ":".into();
        cfg.password = Some("pw".into());
        let BackendSpec::Redis(params) = BackendSpec::select(&cfg).unwrap() else {
            panic!("expected redis");
        };
        assert_eq!(params.nodes, vec!["127.0.0.1:6379".to_string()]);
        assert_eq!(params.separator, ":");
        assert_eq!(params.password.as_deref(), Some("pw"));
    }

    #[cfg(feature = "redis")]
    #[test]
    fn test_redis_password_falls_back_to_client_key() {
        let mut cfg = config("redis");
        cfg.client_key = Some(PathBuf::from("s3cret"));
        let BackendSpec::Redis(params) = BackendSpec::select(&cfg).unwrap() else {
            panic!("expected redis");
        };
        assert_eq!(params.password.as_deref(), Some("s3cret"));

        cfg.password = Some("pw".into());
        let BackendSpec::Redis(params) = BackendSpec::select(&cfg).unwrap() else {
            panic!("expected redis");
        };
        assert_eq!(params.password.as_deref(), Some("pw"));
    }

    #[tokio::test]
    async fn test_file_connect_fails_on_missing_path() {
        let mut cfg = config("file");
        cfg.files = vec![PathBuf::from("/definitely/not/here.yaml")];
        let spec = BackendSpec::select(&cfg).unwrap();
        let err = spec.connect().await.err().unwrap();
        assert!(err.is_construction_error());
    }
}
