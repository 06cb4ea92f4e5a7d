use anyhow::{Context, Result};
use kvsource::{create_client, BackendConfig, KvPairs};
use std::collections::BTreeMap;

/// Fetch `keys` and print them sorted by key.
pub async fn run_get(config: &BackendConfig, keys: &[String], json: bool) -> Result<()> {
    let client = create_client(config)
        .await
        .context("Failed to create backend client")?;
    let values = client.get_values(keys).await?;

    tracing::debug!("Fetched {} values", values.len());
    print!("{}", render(&values, json)?);
    Ok(())
}

pub(crate) fn render(values: &KvPairs, json: bool) -> Result<String> {
    let sorted: BTreeMap<&String, &String> = values.iter().collect();
    if json {
        return Ok(format!("{}\n", serde_json::to_string_pretty(&sorted)?));
    }

    let mut out = String::new();
    for (key, value) in sorted {
        out.push_str(&format!("{}={}\n", key, value));
    }
    Ok(out)
}
