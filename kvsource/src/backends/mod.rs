//! Store adapters, one module per backend kind.

pub mod consul;
pub mod env;
pub mod etcd;
pub mod etcdv3;
pub mod file;
pub mod rancher;
pub mod vault;
pub mod zookeeper;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "aws")]
pub mod dynamodb;
#[cfg(feature = "aws")]
pub mod ssm;

pub use consul::{ConsulParams, ConsulStore};
pub use env::{EnvParams, EnvStore};
pub use etcd::{EtcdParams, EtcdStore};
pub use etcdv3::EtcdV3Store;
pub use file::{FileParams, FileStore};
pub use rancher::{RancherParams, RancherStore};
pub use vault::{VaultAuth, VaultParams, VaultStore};
pub use zookeeper::{ZookeeperParams, ZookeeperStore};

#[cfg(feature = "redis")]
pub use self::redis::{RedisParams, RedisStore};

#[cfg(feature = "aws")]
pub use dynamodb::{DynamoDbParams, DynamoDbStore};
#[cfg(feature = "aws")]
pub use ssm::{SsmParams, SsmStore};
