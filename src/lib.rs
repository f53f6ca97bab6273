//! # fleetlink — device-fleet ↔ A2A agent broker
//!
//! fleetlink sits between a fleet of heterogeneous end devices that expose
//! tool surfaces over long-lived channels, and external agents speaking
//! the Agent-to-Agent (A2A) JSON-RPC 2.0 protocol. It accepts A2A
//! requests, decides which device tool (if any) should fulfill them,
//! dispatches work to a device or delegates it to a peer agent, streams
//! device-produced data through per-device durable logs, and periodically
//! scans those logs to raise new tasks autonomously.
//!
//! ## Architecture
//!
//! - [`device`] — the device model, the narrow tool port
//!   ([`device::DeviceToolPort`]), the registry with its liveness policy,
//!   and the capability-manifest builder that derives the public agent
//!   card from the registry.
//! - [`server`] — the task lifecycle singleton ([`server::TaskManager`]),
//!   the request handler behind every JSON-RPC method, push delivery with
//!   retries, and the axum integration (`POST /a2a` plus the well-known
//!   card routes, SSE streaming).
//! - [`router`] — intent classification: keyword fast path, LLM-backed
//!   analysis through the [`llm::LlmPort`] seam, confidence gating, and
//!   pinned tie-breaks across devices and agents.
//! - [`stream`] — per-device append-only logs with hybrid inline/external
//!   payloads and retention, plus the scan loop feeding the router.
//! - [`client`] — the outbound A2A client used for delegation, the agent
//!   endpoint table, card discovery, and SSE consumption.
//! - [`repository`] — the durability port with in-memory and file-backed
//!   implementations.
//! - [`worker`] — the bounded worker pool with cooperative cancellation.
//! - [`broker`] — assembles the above into a running service.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fleetlink::broker::{Broker, BrokerParts};
//! use fleetlink::config::BrokerConfig;
//! use fleetlink::device::manifest::ServiceIdentity;
//! use fleetlink::repository::InMemoryRepository;
//! use fleetlink::stream::MemoryPayloadStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::start(BrokerParts {
//!         config: BrokerConfig::default(),
//!         repository: Arc::new(InMemoryRepository::new()),
//!         payloads: Arc::new(MemoryPayloadStore::new()),
//!         llm: None,
//!         identity: ServiceIdentity::default(),
//!     })
//!     .await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:7420").await?;
//!     axum::serve(listener, broker.http_router()).await?;
//!     Ok(())
//! }
//! ```
//!
//! Devices attach through [`device::ChannelDevicePort`] (or any other
//! [`device::DeviceToolPort`] implementation), register via
//! [`device::DeviceRegistry::register`], heartbeat to stay online, and
//! append observations to the [`stream::StreamStore`]. The scan loop turns
//! interesting observations into tasks on its own.

pub mod broker;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod llm;
pub mod repository;
pub mod router;
pub mod server;
pub mod stream;
pub mod types;
pub mod worker;

/// Re-exports of the most commonly used types.
///
/// ```
/// use fleetlink::prelude::*;
/// ```
pub mod prelude {
    pub use crate::broker::{Broker, BrokerParts};
    pub use crate::client::{
        resolve_card, AgentClient, AgentEndpoint, AgentEndpointRegistry, EventStream, HttpChannel,
        RpcChannel,
    };
    pub use crate::config::BrokerConfig;
    pub use crate::device::{
        ChannelDevicePort, Device, DevicePatch, DeviceRegistry, DeviceSpec, DeviceToolPort,
        Liveness, ManifestBuilder, ManifestCache, ServiceIdentity, ToolDescriptor,
    };
    pub use crate::error::{BrokerError, BrokerResult};
    pub use crate::llm::{AnalysisContext, LlmPort, RouteAction, RouteAnalysis};
    pub use crate::repository::{file::FileRepository, InMemoryRepository, Repository};
    pub use crate::router::{Decision, IntentRouter, RouteInput, RouteOrigin, RouterConfig};
    pub use crate::server::{
        broker_router, BrokerRequestHandler, EventQueue, RequestHandler, TaskManager,
    };
    pub use crate::stream::{
        FilePayloadStore, MemoryPayloadStore, PayloadRef, ScanLoop, StreamEntry, StreamStore,
    };
    pub use crate::types::{
        AgentCapabilities, AgentCard, AgentSkill, Artifact, FileContent, Message, Part,
        PushNotificationConfig, Role, SendMessageConfiguration, SendMessageParams,
        SendMessageResponse, StreamEvent, StreamOrigin, Task, TaskArtifactUpdateEvent,
        TaskIdParams, TaskState, TaskStatus, TaskStatusUpdateEvent,
    };
    pub use crate::worker::{JobKind, WorkerPool};
}

pub use error::{BrokerError, BrokerResult};
