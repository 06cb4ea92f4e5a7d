//! Process environment backend.
//!
//! Keys map to variable names by dropping the leading `/`, replacing the
//! remaining `/` with `_` and upper-casing: `/app/db_host` reads `APP_DB_HOST`.
//! A key also matches every variable nested beneath it, so `/app` returns
//! `APP_DB_HOST` as `/app/db/host`, and so does `/app/`. The root key `/`
//! returns every variable. The requested key is reported as given; `HOME`
//! reads back as `HOME`.

use async_trait::async_trait;
use std::time::Duration;
use tracing::instrument;

use crate::config::BackendKind;
use crate::error::Result;
use crate::traits::{KvPairs, StopSignal, StoreClient, WatchOutcome};
use crate::watch::{fingerprint, poll_until_changed};

/// Parameters for the environment backend.
#[derive(Debug, Clone)]
pub struct EnvParams {
    pub poll_interval: Duration,
}

/// Reads values from the process environment.
#[derive(Debug, Clone)]
pub struct EnvStore {
    poll_interval: Duration,
}

impl EnvStore {
    pub fn new(params: EnvParams) -> Self {
        Self {
            poll_interval: params.poll_interval,
        }
    }

    fn snapshot(keys: &[String]) -> KvPairs {
        let env: Vec<(String, String)> = std::env::vars().collect();
        let mut vars = KvPairs::new();

        for key in keys {
            let base = key.trim_end_matches('/');
            let name = key_to_env(base);
            for (var, value) in &env {
                // The root key covers every variable.
                if name.is_empty() {
                    vars.insert(env_to_key(var), value.clone());
                } else if var == &name {
                    vars.insert(key.clone(), value.clone());
                } else if let Some(rest) = var.strip_prefix(&name).and_then(|r| r.strip_prefix('_')) {
                    vars.insert(format!("{}{}", base, env_to_key(rest)), value.clone());
                }
            }
        }

        vars
    }
}

/// `/app/db_host` -> `APP_DB_HOST`
pub fn key_to_env(key: &str) -> String {
    key.trim_start_matches('/').replace('/', "_").to_uppercase()
}

/// `APP_DB_HOST` -> `/app/db/host`
pub fn env_to_key(var: &str) -> String {
    format!("/{}", var.to_lowercase().replace('_', "/"))
}

#[async_trait]
impl StoreClient for EnvStore {
    #[instrument(skip(self), fields(backend = "env"))]
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        if keys.is_empty() {
            return Ok(KvPairs::new());
        }
        Ok(Self::snapshot(keys))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        stop: &StopSignal,
    ) -> Result<WatchOutcome> {
        let watched: Vec<String> = if keys.is_empty() {
            vec![prefix.to_string()]
        } else {
            keys.to_vec()
        };

        poll_until_changed(
            || {
                let snapshot = Self::snapshot(&watched);
                async move { Ok(fingerprint(&snapshot)) }
            },
            wait_index,
            self.poll_interval,
            stop,
        )
        .await
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Env
    }
}
