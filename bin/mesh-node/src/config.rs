use anyhow::{Context, Result};
use mesh_api::InstanceDescriptor;
use mesh_core::{FinderConfig, RegistryConfig};
use mesh_rpc::RpcConfig;
use serde::Deserialize;
use std::path::Path;

/// Environment variable naming the YAML config file
pub const CONFIG_ENV: &str = "MESH_CONFIG";

/// One instance hosted by this process
#[derive(Clone, Debug, Deserialize)]
pub struct ServerSpec {
    pub server_type: String,
    pub server_id: String,
    #[serde(default)]
    pub address: String,
}

impl ServerSpec {
    pub fn descriptor(&self) -> InstanceDescriptor {
        InstanceDescriptor::new(&self.server_type, &self.server_id, &self.address)
    }
}

/// Coordination store backing the registry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process, visible to this process only
    #[default]
    Memory,
    Etcd,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub endpoints: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `nats://` or `amqp://` URL matching `rpc.use_type`; in-process when unset
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub registry: RegistryConfig,
    pub rpc: RpcConfig,
    pub finder: FinderConfig,
    pub servers: Vec<ServerSpec>,
}

impl NodeConfig {
    /// Load from the file named by `MESH_CONFIG`, or use defaults
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(&path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Host the demo topology when no servers are configured
    pub fn with_default_servers(mut self) -> Self {
        if self.servers.is_empty() {
            self.servers = default_servers();
        }
        self
    }
}

fn default_servers() -> Vec<ServerSpec> {
    [("gate", "gate-1", "127.0.0.1:3250"), ("game", "game-1", "127.0.0.1:3251"), ("game", "game-2", "127.0.0.1:3252")]
        .into_iter()
        .map(|(server_type, server_id, address)| ServerSpec {
            server_type: server_type.to_string(),
            server_id: server_id.to_string(),
            address: address.to_string(),
        })
        .collect()
}
