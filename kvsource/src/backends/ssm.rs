//! AWS Systems Manager Parameter Store backend.
//!
//! Each requested key is first read as a path (recursively, decrypted) and,
//! when nothing lives below it, as a single parameter.

use async_trait::async_trait;
use aws_sdk_ssm::error::DisplayErrorContext;
use aws_sdk_ssm::types::Parameter;
use aws_sdk_ssm::Client;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::BackendKind;
use crate::error::{BackendError, Result};
use crate::traits::{key_is_watched, KvPairs, StopSignal, StoreClient, WatchOutcome};
use crate::watch::{fingerprint, poll_until_changed};

/// Parameters for the SSM backend.
#[derive(Debug, Clone)]
pub struct SsmParams {
    pub poll_interval: Duration,
}

/// Parameter Store reader.
#[derive(Debug, Clone)]
pub struct SsmStore {
    client: Client,
    poll_interval: Duration,
}

impl SsmStore {
    /// Region and credentials come from the standard AWS environment.
    pub async fn connect(params: SsmParams) -> Result<Self> {
        let sdk_config = aws_config::from_env().load().await;
        Ok(Self {
            client: Client::new(&sdk_config),
            poll_interval: params.poll_interval,
        })
    }

    async fn by_path(&self, path: &str, vars: &mut KvPairs) -> Result<()> {
        let mut next_token = None;
        loop {
            let output = self
                .client
                .get_parameters_by_path()
                .path(path)
                .recursive(true)
                .with_decryption(true)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| BackendError::unreachable(BackendKind::Ssm, DisplayErrorContext(&e)))?;

            for parameter in output.parameters() {
                insert(parameter, vars);
            }

            match output.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => return Ok(()),
            }
        }
    }

    async fn single(&self, name: &str, vars: &mut KvPairs) -> Result<()> {
        let result = self
            .client
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await;

        match result {
            Ok(output) => {
                if let Some(parameter) = output.parameter() {
                    insert(parameter, vars);
                }
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .map(|se| se.is_parameter_not_found())
                    .unwrap_or(false) =>
            {
                debug!(name = %name, "parameter not found");
                Ok(())
            }
            Err(e) => Err(BackendError::unreachable(
                BackendKind::Ssm,
                DisplayErrorContext(&e),
            )),
        }
    }

    async fn snapshot(&self, keys: &[String]) -> Result<KvPairs> {
        let mut vars = KvPairs::new();
        for key in keys {
            let before = vars.len();
            self.by_path(key, &mut vars).await?;
            if vars.len() == before {
                self.single(key, &mut vars).await?;
            }
        }
        Ok(vars)
    }
}

fn insert(parameter: &Parameter, vars: &mut KvPairs) {
    if let (Some(name), Some(value)) = (parameter.name(), parameter.value()) {
        vars.insert(name.to_string(), value.to_string());
    }
}

#[async_trait]
impl StoreClient for SsmStore {
    #[instrument(skip(self), fields(backend = "ssm"))]
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        self.snapshot(keys).await
    }

    #[instrument(skip(self, stop), fields(backend = "ssm"))]
    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        stop: &StopSignal,
    ) -> Result<WatchOutcome> {
        let roots = [prefix.to_string()];
        let roots = &roots;

        poll_until_changed(
            move || async move {
                let mut vars = self.snapshot(roots).await?;
                vars.retain(|k, _| key_is_watched(k, keys));
                Ok(fingerprint(&vars))
            },
            wait_index,
            self.poll_interval,
            stop,
        )
        .await
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Ssm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_requires_name_and_value() {
        let mut vars = KvPairs::new();
        insert(
            &Parameter::builder().name("/app/db").value("pg").build(),
            &mut vars,
        );
        insert(&Parameter::builder().name("/app/empty").build(), &mut vars);

        assert_eq!(vars.len(), 1);
        assert_eq!(vars["/app/db"], "pg");
    }
}
