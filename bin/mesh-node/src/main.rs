use anyhow::{bail, Result};
use mesh_api::InstanceDescriptor;
#[cfg(feature = "etcd")]
use mesh_core::EtcdStore;
use mesh_core::{CoordinationStore, MemoryStore, ServiceRegistry};
#[cfg(feature = "amqp")]
use mesh_rpc::AmqpConnector;
#[cfg(feature = "nats")]
use mesh_rpc::NatsBroker;
use mesh_rpc::{
    broker::QueueConnector, CallOptions, HandlerTable, MemoryBroker, MemoryQueueBroker, MessageHandler,
    NativeTransport, QueueTransport, RpcConfig, RpcError, RpcMetrics, RpcTransport, RpcTransportExt, ServiceNode,
    UseType,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{NodeConfig, StoreKind};

const ECHO: i32 = 1;
const LOAD_REPORT: i32 = 2;

async fn open_store(config: &NodeConfig) -> Result<Arc<dyn CoordinationStore>> {
    match config.store.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "etcd")]
        StoreKind::Etcd => {
            let store = EtcdStore::connect(config.store.endpoints.clone(), config.registry.dial_timeout()).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "etcd"))]
        StoreKind::Etcd => bail!("etcd store configured but mesh-node was built without the `etcd` feature"),
    }
}

/// Broker shared by every instance hosted in this process
enum Broker {
    Native(Arc<MemoryBroker>),
    #[cfg(feature = "nats")]
    Nats(Arc<NatsBroker>),
    Queue(Arc<dyn QueueConnector>),
}

impl Broker {
    async fn connect(config: &NodeConfig) -> Result<Self> {
        match (config.rpc.use_type, config.broker.url.as_deref()) {
            (UseType::Native, None) => Ok(Broker::Native(Arc::new(MemoryBroker::new()))),
            (UseType::Queue, None) => Ok(Broker::Queue(Arc::new(MemoryQueueBroker::new()))),
            #[cfg(feature = "nats")]
            (UseType::Native, Some(url)) => Ok(Broker::Nats(Arc::new(NatsBroker::connect(url).await?))),
            #[cfg(feature = "amqp")]
            (UseType::Queue, Some(url)) => Ok(Broker::Queue(Arc::new(AmqpConnector::new(url)))),
            #[allow(unreachable_patterns)]
            (use_type, Some(url)) => {
                bail!("no {:?} broker adapter built in for {}; enable the nats or amqp feature", use_type, url)
            }
        }
    }

    async fn transport(
        &self,
        server: &InstanceDescriptor,
        config: &RpcConfig,
        metrics: &Arc<RpcMetrics>,
    ) -> Result<Arc<dyn RpcTransport>> {
        let transport: Arc<dyn RpcTransport> = match self {
            Broker::Native(broker) => Arc::new(NativeTransport::new(
                Arc::clone(broker),
                config.clone(),
                Arc::clone(metrics),
            )),
            #[cfg(feature = "nats")]
            Broker::Nats(broker) => Arc::new(NativeTransport::new(
                Arc::clone(broker),
                config.clone(),
                Arc::clone(metrics),
            )),
            Broker::Queue(connector) => Arc::new(
                QueueTransport::connect(Arc::clone(connector), config.clone(), Arc::clone(metrics))
                    .await?
                    .with_instance(&server.server_id),
            ),
        };
        Ok(transport)
    }
}

fn handlers(server: &InstanceDescriptor, registry: &Arc<ServiceRegistry>) -> Result<Arc<dyn MessageHandler>> {
    let server_id = server.server_id.clone();
    let echo_id = server_id.clone();
    let registry = Arc::clone(registry);
    let mut table = HandlerTable::new();
    table
        .on_request(ECHO, move |text: String| {
            let reply = format!("{}: {}", echo_id, text);
            async move { Ok::<_, RpcError>(reply) }
        })?
        .on_publish(LOAD_REPORT, move |load: i64| {
            let registry = Arc::clone(&registry);
            let server_id = server_id.clone();
            async move {
                debug!(server_id = %server_id, load, "Load report received");
                registry.incre_load(&server_id, load).await?;
                Ok::<_, RpcError>(())
            }
        })?;
    Ok(table.into_handler())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting mesh-node...");

    let config = NodeConfig::from_env()?.with_default_servers();
    info!(
        store = ?config.store.kind,
        use_type = ?config.rpc.use_type,
        prefix = %config.rpc.prefix,
        servers = config.servers.len(),
        "Configuration loaded"
    );

    let store = open_store(&config).await?;
    let registry = ServiceRegistry::new(store, config.registry.clone());
    registry.start().await?;

    let metrics = Arc::new(RpcMetrics::new()?);
    let broker = Broker::connect(&config).await?;

    let mut nodes = Vec::with_capacity(config.servers.len());
    for spec in &config.servers {
        let server = spec.descriptor();
        let transport = broker.transport(&server, &config.rpc, &metrics).await?;
        let node = ServiceNode::new(server.clone(), Arc::clone(&registry), transport, handlers(&server, &registry)?)
            .with_finder_config(config.finder.clone());
        node.start().await?;
        nodes.push(node);
    }

    // Let the watch loop observe every local registration
    while registry.server_count().await < nodes.len() {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    registry.dump_servers().await;

    if let Some(caller) = nodes.first() {
        route_demo_traffic(caller).await;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping nodes...");

    for node in &nodes {
        if let Err(e) = node.stop().await {
            warn!(server_id = %node.server().server_id, error = %e, "Failed to stop node");
        }
    }
    registry.shutdown();
    debug!(metrics = %metrics.gather()?, "Final metrics");

    Ok(())
}

/// Route a few players to game instances and echo through them
async fn route_demo_traffic(caller: &ServiceNode) {
    for player in ["player7", "player42", "player1001"] {
        let target = match caller.find("game", player).await {
            Ok(target) => target,
            Err(e) => {
                warn!(player, error = %e, "No game server available");
                continue;
            }
        };
        let reply: Result<String, RpcError> = caller
            .transport()
            .request_value(&target, ECHO, player, &CallOptions::default())
            .await;
        match reply {
            Ok(reply) => info!(player, server_id = %target.server_id, reply = %reply, "Routed request"),
            Err(e) => warn!(player, server_id = %target.server_id, error = %e, "Request failed"),
        }

        if let Err(e) = caller
            .transport()
            .publish_value(&target, LOAD_REPORT, &1i64, &CallOptions::default())
            .await
        {
            warn!(player, error = %e, "Load report failed");
        }
    }
}
