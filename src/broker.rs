//! Broker assembly — constructs the singletons from persisted state,
//! wires them together, spawns the background loops, and tears everything
//! down on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::endpoints::AgentEndpointRegistry;
use crate::config::BrokerConfig;
use crate::device::manifest::{ManifestBuilder, ManifestCache, ServiceIdentity};
use crate::device::registry::DeviceRegistry;
use crate::error::BrokerResult;
use crate::llm::LlmPort;
use crate::repository::Repository;
use crate::router::{IntentRouter, RouterConfig};
use crate::server::push::{PushDeliveryQueue, PushRetryConfig};
use crate::server::request_handler::BrokerRequestHandler;
use crate::server::task_manager::TaskManager;
use crate::stream::scan::ScanLoop;
use crate::stream::store::{PayloadStore, StreamStore};
use crate::types::AgentCapabilities;
use crate::worker::WorkerPool;

/// Everything needed to construct a [`Broker`].
pub struct BrokerParts {
    /// Runtime tunables.
    pub config: BrokerConfig,

    /// Durable storage.
    pub repository: Arc<dyn Repository>,

    /// External payload storage for oversized stream entries.
    pub payloads: Arc<dyn PayloadStore>,

    /// Optional LLM backend; without one, routing uses keywords only.
    pub llm: Option<Arc<dyn LlmPort>>,

    /// Static service identity for the capability manifest.
    pub identity: ServiceIdentity,
}

/// The assembled broker: singletons plus their background loops.
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<DeviceRegistry>,
    endpoints: Arc<AgentEndpointRegistry>,
    tasks: Arc<TaskManager>,
    stream: Arc<StreamStore>,
    workers: Arc<WorkerPool>,
    push: Arc<PushDeliveryQueue>,
    manifest: Arc<ManifestCache>,
    handler: Arc<BrokerRequestHandler>,
    scan: Arc<ScanLoop>,
    shutdown: CancellationToken,
}

impl Broker {
    /// Construct the broker from persisted state and start its loops.
    pub async fn start(parts: BrokerParts) -> BrokerResult<Arc<Self>> {
        let BrokerParts {
            config,
            repository,
            payloads,
            llm,
            identity,
        } = parts;

        let shutdown = CancellationToken::new();

        let registry = Arc::new(DeviceRegistry::new(Arc::clone(&repository)));
        registry.hydrate().await?;

        let endpoints = Arc::new(AgentEndpointRegistry::new(Arc::clone(&repository)));
        endpoints.hydrate().await?;

        let push = Arc::new(PushDeliveryQueue::new(PushRetryConfig {
            max_attempts: config.push_max_attempts,
            base_delay: Duration::from_secs(config.push_backoff_base_secs),
            max_delay: Duration::from_secs(config.push_backoff_cap_secs),
            attempt_timeout: Duration::from_secs(config.push_attempt_timeout_secs),
        }));

        let tasks = Arc::new(TaskManager::new(
            Arc::clone(&repository),
            Arc::clone(&push),
            config.state_transition_history,
            true,
        ));
        tasks.hydrate().await?;

        let stream = Arc::new(StreamStore::new(
            payloads,
            config.inline_payload_threshold,
            config.retention(),
        ));

        let router = Arc::new(IntentRouter::new(
            llm,
            RouterConfig {
                min_keyword_overlap: config.min_keyword_overlap,
                confidence_threshold: config.confidence_threshold,
                llm_timeout: config.llm_timeout(),
            },
        ));

        let workers = Arc::new(WorkerPool::new(
            config.worker_count,
            config.queue_depth,
            config.submit_grace(),
        ));

        let handler = Arc::new(BrokerRequestHandler::new(
            Arc::clone(&tasks),
            Arc::clone(&registry),
            Arc::clone(&endpoints),
            Arc::clone(&router),
            Arc::clone(&workers),
            &config,
        ));

        // Capability manifest: initial build plus the coalesced rebuilder.
        let builder = ManifestBuilder::new(
            identity,
            AgentCapabilities {
                streaming: Some(true),
                push_notifications: Some(true),
                state_transition_history: Some(config.state_transition_history),
            },
        );
        let manifest = Arc::new(ManifestCache::new(
            builder.build(&registry.snapshot().await),
        ));
        Arc::clone(&manifest).spawn_rebuilder(
            builder,
            Arc::clone(&registry),
            registry.rebuild_signal(),
            shutdown.clone(),
        );

        let scan = Arc::new(ScanLoop::new(
            Arc::clone(&stream),
            Arc::clone(&registry),
            router,
            Arc::clone(&endpoints),
            handler.clone(),
            Arc::clone(&repository),
            config.scan_batch_limit,
        ));

        // Background loops.
        Arc::clone(&registry).spawn_liveness_sweeper(
            Duration::from_secs(config.liveness_sweep_interval_secs),
            config.heartbeat_grace(),
            shutdown.clone(),
        );
        Arc::clone(&stream).spawn_retention_sweeper(
            Duration::from_secs(config.retention_sweep_interval_secs),
            shutdown.clone(),
        );
        Arc::clone(&scan).spawn(config.scan_interval(), shutdown.clone());

        info!("Broker started");
        Ok(Arc::new(Self {
            config,
            registry,
            endpoints,
            tasks,
            stream,
            workers,
            push,
            manifest,
            handler,
            scan,
            shutdown,
        }))
    }

    /// The runtime configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The device registry (device ingress adapters register/heartbeat
    /// through this).
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The external agent endpoint table.
    pub fn endpoints(&self) -> &Arc<AgentEndpointRegistry> {
        &self.endpoints
    }

    /// The task manager.
    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// The per-device stream store (device ingress adapters append here).
    pub fn stream(&self) -> &Arc<StreamStore> {
        &self.stream
    }

    /// The request handler (for transports beyond the bundled axum one).
    pub fn handler(&self) -> Arc<BrokerRequestHandler> {
        Arc::clone(&self.handler)
    }

    /// The cached capability manifest.
    pub fn manifest(&self) -> &Arc<ManifestCache> {
        &self.manifest
    }

    /// The scan loop, exposed so deployments (and tests) can force a tick.
    pub fn scan(&self) -> &Arc<ScanLoop> {
        &self.scan
    }

    /// The axum router serving `/a2a` and the well-known card paths.
    pub fn http_router(&self) -> axum::Router {
        crate::server::broker_router(self.handler(), Arc::clone(&self.manifest))
    }

    /// Stop the background loops, the worker pool, and push delivery.
    pub fn shutdown(&self) {
        info!("Broker shutting down");
        self.shutdown.cancel();
        self.workers.shutdown();
        self.push.shutdown();
    }
}
