//! Lifecycle context of one service instance

use crate::subject::{DEFAULT_SUFFIX, JSON_SUFFIX};
use crate::{MessageHandler, Result, RpcError, RpcTransport, SubscribeOptions};
use mesh_api::{CodeType, InstanceDescriptor};
use mesh_core::{Finder, FinderConfig, ServiceRegistry};
use std::sync::Arc;
use tracing::info;

/// Code types every node listens on, with the suffix each travels under
const CHANNELS: [(CodeType, &str); 2] = [(CodeType::Binary, DEFAULT_SUFFIX), (CodeType::Json, JSON_SUFFIX)];

/// ServiceNode ties an instance's descriptor, registry, transport and
/// handlers together.
///
/// `start` subscribes the instance's direct and broadcast channels for
/// every code type and only then registers it, so peers never route to an
/// instance that is not listening yet. `stop` reverses that order.
pub struct ServiceNode {
    server: InstanceDescriptor,
    registry: Arc<ServiceRegistry>,
    finder: Finder,
    transport: Arc<dyn RpcTransport>,
    handler: Arc<dyn MessageHandler>,
    broadcast_handler: Option<Arc<dyn MessageHandler>>,
}

impl ServiceNode {
    pub fn new(
        server: InstanceDescriptor,
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn RpcTransport>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let finder = Finder::new(Arc::clone(&registry), FinderConfig::default());
        Self {
            server,
            registry,
            finder,
            transport,
            handler,
            broadcast_handler: None,
        }
    }

    pub fn with_finder_config(mut self, config: FinderConfig) -> Self {
        self.finder = Finder::new(Arc::clone(&self.registry), config);
        self
    }

    /// Handle broadcasts separately from direct messages
    pub fn with_broadcast_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.broadcast_handler = Some(handler);
        self
    }

    pub async fn start(&self) -> Result<()> {
        let broadcast = self.broadcast_handler.as_ref().unwrap_or(&self.handler);
        for (code_type, suffix) in CHANNELS {
            let options = SubscribeOptions::default()
                .with_code_type(code_type)
                .with_suffix(suffix);
            self.transport
                .subscribe(&self.server, options.clone(), Arc::clone(&self.handler))
                .await?;
            self.transport
                .subscribe_broadcast(&self.server, options, Arc::clone(broadcast))
                .await?;
        }
        self.registry.register(&self.server).await?;
        info!(server_type = %self.server.server_type, server_id = %self.server.server_id, "Service node started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.registry.unregister(&self.server).await?;
        self.transport.close().await?;
        info!(server_type = %self.server.server_type, server_id = %self.server.server_id, "Service node stopped");
        Ok(())
    }

    /// Sticky instance of `server_type` for routing argument `arg`, skipping maintained ones
    pub async fn find(&self, server_type: &str, arg: &str) -> Result<InstanceDescriptor> {
        self.find_with(server_type, arg, true)
            .await
            .ok_or_else(|| RpcError::NotFound(format!("no eligible {} server", server_type)))
    }

    pub async fn find_with(
        &self,
        server_type: &str,
        arg: &str,
        filter_maintained: bool,
    ) -> Option<InstanceDescriptor> {
        self.finder.find(server_type, arg, filter_maintained).await
    }

    /// Release the stickiness of `arg`, e.g. when its player disconnects
    pub fn remove_find_cache(&self, arg: &str) {
        self.finder.remove(arg);
    }

    pub fn server(&self) -> &InstanceDescriptor {
        &self.server
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn RpcTransport> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::{CallOptions, HandlerTable, NativeTransport, RpcConfig, RpcMetrics, RpcTransportExt};
    use mesh_core::{MemoryStore, RegistryConfig};
    use std::time::Duration;

    const WHOAMI: i32 = 1;

    fn transport(broker: &Arc<MemoryBroker>) -> Arc<dyn RpcTransport> {
        Arc::new(NativeTransport::new(
            Arc::clone(broker),
            RpcConfig::default(),
            Arc::new(RpcMetrics::new().unwrap()),
        ))
    }

    fn node(id: &str, registry: &Arc<ServiceRegistry>, broker: &Arc<MemoryBroker>) -> ServiceNode {
        let server_id = id.to_string();
        let mut table = HandlerTable::new();
        table
            .on_request(WHOAMI, move |_: ()| {
                let server_id = server_id.clone();
                async move { Ok::<_, RpcError>(server_id) }
            })
            .unwrap();
        ServiceNode::new(
            InstanceDescriptor::new("game", id, ""),
            Arc::clone(registry),
            transport(broker),
            table.into_handler(),
        )
    }

    async fn wait_for_count(registry: &ServiceRegistry, count: usize) {
        for _ in 0..200 {
            if registry.server_count().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("registry never reached {} servers", count);
    }

    #[tokio::test]
    async fn test_start_subscribes_then_registers() {
        let store = Arc::new(MemoryStore::new());
        let registry = ServiceRegistry::new(store, RegistryConfig::default());
        registry.start().await.unwrap();
        let broker = Arc::new(MemoryBroker::new());

        let game = node("g1", &registry, &broker);
        game.start().await.unwrap();
        wait_for_count(&registry, 1).await;
        for subject in ["Rpc/game/g1", "Rpc/game/g1/json", "Rpc/game", "Rpc/game/json"] {
            assert_eq!(broker.subscriber_count(subject), 1, "{}", subject);
        }

        let gate = node("gate", &registry, &broker);
        let target = gate.find("game", "player42").await.unwrap();
        for options in [
            CallOptions::default(),
            CallOptions::default().with_code_type(CodeType::Json).with_suffix("json"),
        ] {
            let answer: String = gate
                .transport()
                .request_value(&target, WHOAMI, &(), &options)
                .await
                .unwrap();
            assert_eq!(answer, "g1");
        }

        game.stop().await.unwrap();
        wait_for_count(&registry, 0).await;
        assert!(matches!(
            gate.find("game", "player42").await,
            Err(RpcError::NotFound(_))
        ));
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_find_is_sticky_until_removed() {
        let store = Arc::new(MemoryStore::new());
        let registry = ServiceRegistry::new(store, RegistryConfig::default());
        registry.start().await.unwrap();
        let broker = Arc::new(MemoryBroker::new());

        let g1 = node("g1", &registry, &broker);
        g1.start().await.unwrap();
        wait_for_count(&registry, 1).await;

        let gate = node("gate", &registry, &broker);
        assert_eq!(gate.find("game", "player7").await.unwrap().server_id, "g1");

        // player7 hashes to g3 once g2 and g3 join, but stays with g1 while cached
        let g2 = node("g2", &registry, &broker);
        let g3 = node("g3", &registry, &broker);
        g2.start().await.unwrap();
        g3.start().await.unwrap();
        wait_for_count(&registry, 3).await;
        assert_eq!(gate.find("game", "player7").await.unwrap().server_id, "g1");

        gate.remove_find_cache("player7");
        assert_eq!(gate.find("game", "player7").await.unwrap().server_id, "g3");
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_find_skips_maintained_instance() {
        let store = Arc::new(MemoryStore::new());
        let registry = ServiceRegistry::new(store, RegistryConfig::default());
        registry.start().await.unwrap();
        let broker = Arc::new(MemoryBroker::new());

        let g1 = node("g1", &registry, &broker);
        g1.start().await.unwrap();
        wait_for_count(&registry, 1).await;
        registry.set_maintenance("g1", true).await.unwrap();

        let gate = node("gate", &registry, &broker);
        assert!(gate.find("game", "player1").await.is_err());
        assert_eq!(
            gate.find_with("game", "player1", false).await.unwrap().server_id,
            "g1"
        );
        registry.shutdown();
    }
}
