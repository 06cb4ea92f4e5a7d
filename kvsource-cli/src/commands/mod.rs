pub mod backends;
pub mod get;
pub mod watch;

pub use backends::run_backends;
pub use get::run_get;
pub use watch::run_watch;

use anyhow::{Context, Result};
use clap::Args;
use kvsource::BackendConfig;
use std::path::PathBuf;

/// Backend selection flags shared by every command.
///
/// Flags override values read from `--config`.
#[derive(Args, Debug, Default)]
pub struct BackendArgs {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "KVSOURCE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Backend kind (etcd, consul, vault, file, ...)
    #[arg(short, long, global = true, env = "KVSOURCE_BACKEND")]
    pub backend: Option<String>,

    /// Backend node address (repeatable)
    #[arg(short, long = "node", global = true, env = "KVSOURCE_NODES", value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// URL scheme for nodes given without one
    #[arg(long, global = true, env = "KVSOURCE_SCHEME")]
    pub scheme: Option<String>,

    /// File or directory for the file backend (repeatable)
    #[arg(long = "file", global = true, env = "KVSOURCE_FILES", value_delimiter = ',')]
    pub files: Vec<PathBuf>,

    /// File name glob used when walking directories
    #[arg(long, global = true, env = "KVSOURCE_FILTER")]
    pub filter: Option<String>,

    /// Key separator for the redis backend
    #[arg(long, global = true, env = "KVSOURCE_SEPARATOR")]
    pub separator: Option<String>,

    /// DynamoDB table
    #[arg(long, global = true, env = "KVSOURCE_TABLE")]
    pub table: Option<String>,

    /// Vault auth method
    #[arg(long, global = true, env = "KVSOURCE_AUTH_TYPE")]
    pub auth_type: Option<String>,

    /// Vault or github token
    #[arg(long, global = true, env = "KVSOURCE_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Poll interval in milliseconds for backends without change notification
    #[arg(long, global = true, env = "KVSOURCE_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,
}

impl BackendArgs {
    /// Merge the config file (if any) with the flags.
    pub fn to_config(&self) -> Result<BackendConfig> {
        let mut config = match &self.config {
            Some(path) => BackendConfig::load(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => BackendConfig::default(),
        };

        if let Some(backend) = &self.backend {
            config.backend = Some(backend.clone());
        }
        if !self.nodes.is_empty() {
            config.nodes = self.nodes.clone();
        }
        if let Some(scheme) = &self.scheme {
            config.scheme = scheme.clone();
        }
        if !self.files.is_empty() {
            config.files = self.files.clone();
        }
        if let Some(filter) = &self.filter {
            config.filter = filter.clone();
        }
        if let Some(separator) = &self.separator {
            config.separator = separator.clone();
        }
        if let Some(table) = &self.table {
            config.table = Some(table.clone());
        }
        if let Some(auth_type) = &self.auth_type {
            config.auth_type = Some(auth_type.clone());
        }
        if let Some(auth_token) = &self.auth_token {
            config.auth_token = Some(auth_token.clone());
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }

        Ok(config)
    }
}
