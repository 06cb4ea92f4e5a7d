use anyhow::{Context, Result};
use kvsource::{create_client, BackendConfig, StopSignal, WatchOutcome};

use super::get::render;

/// Watch `prefix` and print the index and values after every change.
///
/// Ctrl-C stops the watch cleanly.
pub async fn run_watch(
    config: &BackendConfig,
    prefix: &str,
    keys: &[String],
    mut index: u64,
    once: bool,
) -> Result<()> {
    let client = create_client(config)
        .await
        .context("Failed to create backend client")?;

    let stop = StopSignal::new();
    let on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping watch");
            on_signal.cancel();
        }
    });

    let watched: Vec<String> = if keys.is_empty() {
        vec![prefix.to_string()]
    } else {
        keys.to_vec()
    };

    loop {
        match client.watch_prefix(prefix, keys, index, &stop).await? {
            WatchOutcome::Changed(next) => {
                tracing::debug!("Index {} -> {}", index, next);
                index = next;
                let values = client.get_values(&watched).await?;
                println!("# index {}", index);
                print!("{}", render(&values, false)?);
                if once {
                    break;
                }
            }
            WatchOutcome::Cancelled => break,
        }
    }

    Ok(())
}
