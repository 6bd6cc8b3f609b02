//! Engine assembly and lifecycle
//!
//! One dependency graph is built at startup and handed down explicitly: no
//! module-level singletons, no ambient state. The builder takes injected
//! collaborators (store, queue, clients, sinks) and the built [`Engine`]
//! owns its worker pools, reaper, and outbox relay until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clients::{DnsClient, HttpClient, ProxyRegistry, StoreProxyRegistry};
use crate::config::EngineConfig;
use crate::control::ControlRegistry;
use crate::events::{BroadcastSink, EventEnvelope, EventSink, OutboxRelay};
use crate::orchestrator::Orchestrator;
use crate::queue::{spawn_reaper, JobQueue, MemoryJobQueue};
use crate::store::{memory::MemoryStore, EngineStore};
use crate::workers::{
    analysis::AnalysisProcessor, dns::DnsProcessor, generation::GenerationProcessor,
    http::HttpProcessor, spawn_pool, JobProcessor, WorkerContext,
};

/// Capacity of the in-process event broadcast channel
const BROADCAST_CAPACITY: usize = 1_024;

/// Grace period a task gets to wind down during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Builder for the engine's dependency graph
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn EngineStore>>,
    queue: Option<Arc<dyn JobQueue>>,
    dns_client: Option<Arc<dyn DnsClient>>,
    http_client: Option<Arc<dyn HttpClient>>,
    proxy_registry: Option<Arc<dyn ProxyRegistry>>,
    extra_sinks: Vec<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            queue: None,
            dns_client: None,
            http_client: None,
            proxy_registry: None,
            extra_sinks: Vec::new(),
        }
    }

    /// Use an explicit store backend instead of the in-memory default
    pub fn store(mut self, store: Arc<dyn EngineStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use an explicit queue backend instead of the in-memory default
    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Inject the DNS transport
    pub fn dns_client(mut self, client: Arc<dyn DnsClient>) -> Self {
        self.dns_client = Some(client);
        self
    }

    /// Inject the HTTP transport
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Inject the proxy source; defaults to the store's proxy table
    pub fn proxy_registry(mut self, registry: Arc<dyn ProxyRegistry>) -> Self {
        self.proxy_registry = Some(registry);
        self
    }

    /// Add an event sink alongside the built-in broadcast channel
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    /// Build the graph and spawn pools, reaper, and outbox relay
    pub fn start(self) -> Engine {
        let config = Arc::new(self.config);
        let store: Arc<dyn EngineStore> = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let queue: Arc<dyn JobQueue> = self
            .queue
            .unwrap_or_else(|| Arc::new(MemoryJobQueue::new(&config.queue)));
        let dns_client = self.dns_client.unwrap_or_else(default_dns_client);
        let http_client: Arc<dyn HttpClient> = self
            .http_client
            .unwrap_or_else(|| Arc::new(crate::fetch::ReqwestHttpClient::new()));
        let proxy_registry: Arc<dyn ProxyRegistry> = self
            .proxy_registry
            .unwrap_or_else(|| Arc::new(StoreProxyRegistry::new(store.clone())));

        let shutdown = CancellationToken::new();
        let controls = Arc::new(ControlRegistry::new(shutdown.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            queue.clone(),
            controls.clone(),
            config.clone(),
        ));

        let ctx = WorkerContext {
            store: store.clone(),
            queue: queue.clone(),
            controls: controls.clone(),
            config: config.clone(),
        };

        let mut tasks = Vec::new();
        let pools: [(Arc<dyn JobProcessor>, usize); 4] = [
            (
                Arc::new(GenerationProcessor::new(store.clone())),
                config.pools.generation_workers,
            ),
            (
                Arc::new(DnsProcessor::new(
                    store.clone(),
                    dns_client,
                    config.pools.dns_fanout,
                )),
                config.pools.dns_workers,
            ),
            (
                Arc::new(HttpProcessor::new(
                    store.clone(),
                    http_client,
                    proxy_registry,
                    config.http.clone(),
                )),
                config.pools.http_workers,
            ),
            (
                Arc::new(AnalysisProcessor::new(store.clone())),
                config.pools.analysis_workers,
            ),
        ];
        for (processor, size) in pools {
            tasks.extend(spawn_pool(ctx.clone(), processor, size));
        }

        tasks.push(spawn_reaper(
            queue.clone(),
            Duration::from_millis(config.queue.reaper_interval_ms),
            shutdown.clone(),
        ));
        tasks.push(crate::workers::spawn_phase_watchdog(
            ctx.clone(),
            Duration::from_millis(config.queue.reaper_interval_ms),
            shutdown.clone(),
        ));

        let broadcast = Arc::new(BroadcastSink::new(BROADCAST_CAPACITY));
        let mut sinks: Vec<Arc<dyn EventSink>> = vec![broadcast.clone()];
        sinks.extend(self.extra_sinks);
        let relay = OutboxRelay::new(store.clone(), sinks);
        let relay_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            relay.run(relay_shutdown).await;
        }));

        tracing::info!(
            generation_workers = config.pools.generation_workers,
            dns_workers = config.pools.dns_workers,
            http_workers = config.pools.http_workers,
            analysis_workers = config.pools.analysis_workers,
            "Engine started"
        );

        Engine {
            orchestrator,
            broadcast,
            shutdown,
            tasks,
        }
    }
}

#[cfg(feature = "resolver")]
fn default_dns_client() -> Arc<dyn DnsClient> {
    Arc::new(crate::resolver::HickoryDnsClient::new())
}

#[cfg(not(feature = "resolver"))]
fn default_dns_client() -> Arc<dyn DnsClient> {
    Arc::new(crate::clients::SystemDnsClient)
}

/// A running engine: orchestrator plus its background machinery
pub struct Engine {
    orchestrator: Arc<Orchestrator>,
    broadcast: Arc<BroadcastSink>,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Builder with the given configuration
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Command surface
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Subscribe to lifecycle and progress events
    ///
    /// The channel is lossy for subscribers that fall behind.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventEnvelope> {
        self.broadcast.subscribe()
    }

    /// Cooperative shutdown: cancel everything, then wait briefly per task
    pub async fn shutdown(self) {
        tracing::info!("Engine shutting down");
        self.shutdown.cancel();
        for task in self.tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    tracing::warn!(error = %e, "Task panicked during shutdown");
                }
                Ok(Err(_)) => {}
                Err(_) => tracing::warn!("Task did not stop within the grace period"),
            }
        }
        tracing::info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_starts_and_stops() {
        let engine = Engine::builder(EngineConfig::default()).start();
        let _receiver = engine.subscribe();
        engine.shutdown().await;
    }
}
