//! Uniform access to key-value configuration stores.
//!
//! Every supported store (etcd, Consul, ZooKeeper, Redis, Vault, files, the
//! process environment, ...) sits behind one [`StoreClient`] trait with two
//! operations: fetch the values under a set of keys, and block until
//! something under a prefix changes. A template renderer built on top only
//! ever sees that trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  BackendConfig (TOML / CLI flags)                │
//! │                      │                           │
//! │                      ▼                           │
//! │            ┌──────────────────┐                  │
//! │            │  create_client   │  kind → spec     │
//! │            └────────┬─────────┘                  │
//! │                     ▼                            │
//! │            ┌──────────────────┐                  │
//! │            │  MeteredStore    │  metrics         │
//! │            └────────┬─────────┘                  │
//! │                     ▼                            │
//! │  ┌──────┐ ┌────────┐ ┌───────┐ ┌──────┐ ┌─────┐  │
//! │  │ etcd │ │ consul │ │ vault │ │ file │ │ ... │  │
//! │  └──────┘ └────────┘ └───────┘ └──────┘ └─────┘  │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use kvsource::{create_client, BackendConfig, BackendKind, StopSignal, WatchOutcome};
//!
//! # async fn example() -> kvsource::Result<()> {
//! let mut config = BackendConfig::for_kind(BackendKind::File);
//! config.files = vec!["/etc/myapp/config.yaml".into()];
//!
//! let client = create_client(&config).await?;
//! let values = client.get_values(&["/db".to_string()]).await?;
//! println!("db host: {:?}", values.get("/db/host"));
//!
//! // Wait for the next change under /db
//! let stop = StopSignal::new();
//! let mut index = 0;
//! loop {
//!     match client.watch_prefix("/db", &[], index, &stop).await? {
//!         WatchOutcome::Changed(next) => index = next,
//!         WatchOutcome::Cancelled => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `redis` - Redis backend (default)
//! - `aws` - DynamoDB and SSM Parameter Store backends (default)

pub mod backend;
pub mod backends;
mod client;
pub mod config;
mod error;
pub mod http;
pub mod metrics;
mod traits;
pub mod watch;

pub use backend::BackendSpec;
pub use client::create_client;
pub use config::{AuthType, BackendConfig, BackendKind};
pub use error::{BackendError, Result};
pub use metrics::MeteredStore;
pub use traits::{KvPairs, StopSignal, StoreClient, WatchOutcome};
