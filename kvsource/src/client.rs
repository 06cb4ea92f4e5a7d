//! Client factory.

use tracing::info;

use crate::backend::BackendSpec;
use crate::config::{BackendConfig, BackendKind};
use crate::error::Result;
use crate::metrics::MeteredStore;
use crate::traits::StoreClient;

/// Build the store client described by `config`.
///
/// The kind defaults to etcd. Construction errors from the adapter are
/// returned unchanged; nothing is retried here.
pub async fn create_client(config: &BackendConfig) -> Result<Box<dyn StoreClient>> {
    let kind = config.kind()?;

    let sources = match kind {
        BackendKind::File => config
            .files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>(),
        _ => config.nodes_for(kind),
    };
    info!(backend = %kind, "Backend source(s) set to {}", sources.join(", "));

    let spec = BackendSpec::select(config)?;
    let store = spec.connect().await?;

    Ok(Box::new(MeteredStore::new(store)))
}
