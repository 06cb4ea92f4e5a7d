//! AWS DynamoDB backend.
//!
//! Items live in one table with a string partition key `key` and a string
//! attribute `value`. An exact key is read with `GetItem`; when it is absent
//! the key is treated as a prefix and the table is scanned.

use async_trait::async_trait;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::BackendKind;
use crate::error::{BackendError, Result};
use crate::traits::{key_is_watched, KvPairs, StopSignal, StoreClient, WatchOutcome};
use crate::watch::{fingerprint, poll_until_changed};

const KEY_ATTR: &str = "key";
const VALUE_ATTR: &str = "value";

/// Parameters for the DynamoDB backend.
#[derive(Debug, Clone)]
pub struct DynamoDbParams {
    pub table: String,
    /// Endpoint override, e.g. a local DynamoDB.
    pub endpoint: Option<String>,
    pub poll_interval: Duration,
}

/// DynamoDB table reader.
#[derive(Debug, Clone)]
pub struct DynamoDbStore {
    client: Client,
    table: String,
    poll_interval: Duration,
}

impl DynamoDbStore {
    /// Load AWS settings from the environment and check the table exists.
    pub async fn connect(params: DynamoDbParams) -> Result<Self> {
        let mut loader = aws_config::from_env();
        if let Some(endpoint) = &params.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let client = Client::new(&sdk_config);

        client
            .describe_table()
            .table_name(&params.table)
            .send()
            .await
            .map_err(|e| {
                BackendError::construction(
                    BackendKind::Dynamodb,
                    format!("table {}: {}", params.table, DisplayErrorContext(&e)),
                )
            })?;
        info!(table = %params.table, "DynamoDB table ready");

        Ok(Self {
            client,
            table: params.table,
            poll_interval: params.poll_interval,
        })
    }

    async fn get_item(&self, key: &str) -> Result<Option<HashMap<String, AttributeValue>>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(KEY_ATTR, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| BackendError::unreachable(BackendKind::Dynamodb, DisplayErrorContext(&e)))?;
        Ok(output.item)
    }

    async fn scan_prefix(&self, prefix: &str, vars: &mut KvPairs) -> Result<()> {
        let mut start_key = None;
        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table)
                .filter_expression("begins_with(#k, :prefix)")
                .expression_attribute_names("#k", KEY_ATTR)
                .expression_attribute_values(":prefix", AttributeValue::S(prefix.to_string()))
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| {
                    BackendError::unreachable(BackendKind::Dynamodb, DisplayErrorContext(&e))
                })?;

            for item in output.items() {
                if let Some((key, value)) = pair_from_item(item) {
                    vars.insert(key, value);
                }
            }

            match output.last_evaluated_key {
                Some(last) if !last.is_empty() => start_key = Some(last),
                _ => return Ok(()),
            }
        }
    }
}

/// `(key, value)` of an item whose attributes are both strings.
fn pair_from_item(item: &HashMap<String, AttributeValue>) -> Option<(String, String)> {
    let key = item.get(KEY_ATTR)?.as_s().ok()?;
    match item.get(VALUE_ATTR).map(AttributeValue::as_s) {
        Some(Ok(value)) => Some((key.clone(), value.clone())),
        _ => {
            warn!(key = %key, "skipping item without a string value");
            None
        }
    }
}

#[async_trait]
impl StoreClient for DynamoDbStore {
    #[instrument(skip(self), fields(backend = "dynamodb"))]
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        let mut vars = KvPairs::new();
        for key in keys {
            match self.get_item(key).await? {
                Some(item) => {
                    if let Some((k, v)) = pair_from_item(&item) {
                        vars.insert(k, v);
                    }
                }
                None => self.scan_prefix(key, &mut vars).await?,
            }
        }
        Ok(vars)
    }

    #[instrument(skip(self, stop), fields(backend = "dynamodb"))]
    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        stop: &StopSignal,
    ) -> Result<WatchOutcome> {
        poll_until_changed(
            move || async move {
                let mut vars = KvPairs::new();
                self.scan_prefix(prefix, &mut vars).await?;
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
        BackendKind::Dynamodb
    }
}
