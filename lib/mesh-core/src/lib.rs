//! Core service discovery and routing functionality
//!
//! This library provides:
//! - Service registry kept current by watching a coordination store
//! - Consistent-hash rings for deterministic, sticky instance selection
//! - Maintenance and load aware selection
//! - Sticky selection cache in front of the registry

pub mod config;
pub mod error;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod finder;
pub mod registry;
pub mod ring;
pub mod store;

pub use config::{FinderConfig, RegistryConfig};
pub use error::{CoreError, Result};
pub use finder::Finder;
pub use registry::{RegistryEvent, ServiceRegistry};
pub use ring::HashRing;
pub use store::{CoordinationStore, KeyValue, MemoryStore, Snapshot, WatchEvent, WatchStream};

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
