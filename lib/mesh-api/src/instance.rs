use serde::{Deserialize, Serialize};

/// InstanceDescriptor describes one running service instance.
///
/// The instance owns its descriptor and publishes it to the coordination
/// store; every registry client holds a read-only replica.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    /// Logical service type, e.g. "game" or "connector"
    pub server_type: String,

    /// Instance id, unique within its type
    pub server_id: String,

    /// Human readable name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_name: String,

    /// Network address clients use to reach the instance
    #[serde(default)]
    pub address: String,

    /// Load counter, adjusted through the registry
    #[serde(default)]
    pub load: i64,

    /// Maintained instances receive no newly routed traffic
    #[serde(default)]
    pub maintained: bool,

    /// Suppresses registration logging for frequent load updates
    #[serde(default)]
    pub silent: bool,
}

impl InstanceDescriptor {
    pub fn new(
        server_type: impl Into<String>,
        server_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            server_type: server_type.into(),
            server_id: server_id.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_load(mut self, load: i64) -> Self {
        self.load = load;
        self
    }

    pub fn with_maintained(mut self, maintained: bool) -> Self {
        self.maintained = maintained;
        self
    }

    /// The `<type>/<id>` path segment identifying this instance
    pub fn item_path(&self) -> String {
        format!("{}/{}", self.server_type, self.server_id)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}
