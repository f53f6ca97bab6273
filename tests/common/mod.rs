//! Shared fixtures for the integration suites: canned devices, a scripted
//! LLM port, a capturing push receiver, and a broker wired for fast tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use tokio::sync::Mutex;

use fleetlink::broker::{Broker, BrokerParts};
use fleetlink::config::BrokerConfig;
use fleetlink::device::manifest::ServiceIdentity;
use fleetlink::device::{ChannelDevicePort, DeviceSpec, ToolDescriptor};
use fleetlink::error::BrokerResult;
use fleetlink::llm::{AnalysisContext, LlmPort, RouteAnalysis};
use fleetlink::repository::InMemoryRepository;
use fleetlink::stream::MemoryPayloadStore;
use fleetlink::types::Part;

/// A broker configuration with short deadlines suitable for tests.
pub fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.blocking_request_timeout_secs = 2;
    config.submit_grace_secs = 1;
    config.tool_timeout_secs = 5;
    config.push_backoff_base_secs = 0;
    config.push_attempt_timeout_secs = 2;
    config.scan_interval_secs = 3600; // ticks are driven manually
    config.liveness_sweep_interval_secs = 3600;
    config.retention_sweep_interval_secs = 3600;
    config
}

/// Start a broker on in-memory storage.
pub async fn test_broker(
    config: BrokerConfig,
    llm: Option<Arc<dyn LlmPort>>,
) -> Arc<Broker> {
    test_broker_with_repo(config, llm, Arc::new(InMemoryRepository::new())).await
}

/// Start a broker on a caller-held repository (for watermark/restart tests).
pub async fn test_broker_with_repo(
    config: BrokerConfig,
    llm: Option<Arc<dyn LlmPort>>,
    repository: Arc<InMemoryRepository>,
) -> Arc<Broker> {
    Broker::start(BrokerParts {
        config,
        repository,
        payloads: Arc::new(MemoryPayloadStore::new()),
        llm,
        identity: ServiceIdentity::default(),
    })
    .await
    .expect("broker start")
}

/// Serve the broker over HTTP on an ephemeral port; returns the base URL.
pub async fn serve(broker: &Arc<Broker>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = broker.http_router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

// ---------------------------------------------------------------------------
// Canned devices
// ---------------------------------------------------------------------------

/// How a test device answers tool invocations.
#[derive(Clone)]
pub enum DeviceBehavior {
    /// Reply with a file part referencing a fake blob.
    ReplyFile,
    /// Reply with a single text part.
    ReplyText(String),
    /// Report a device-side failure.
    Fail(String),
    /// Never reply (the invocation hangs until canceled).
    Never,
}

/// Handle to a spawned test device.
pub struct TestDevice {
    pub port: Arc<ChannelDevicePort>,
    pub invocations: Arc<AtomicUsize>,
}

impl TestDevice {
    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

/// The canonical camera tool used across suites.
pub fn capture_tool() -> ToolDescriptor {
    ToolDescriptor {
        tool_id: "capture_image".to_string(),
        description: Some("Capture a still image".to_string()),
        input_schema: serde_json::json!({"type": "object"}),
        output_schema: serde_json::json!({"type": "object"}),
        timeout_secs: None,
        output_modes: Some(vec!["image/jpeg".to_string()]),
    }
}

/// Spawn a device serving its channel with the given behavior.
pub fn spawn_device(tools: Vec<ToolDescriptor>, behavior: DeviceBehavior) -> TestDevice {
    let (port, mut conn) = ChannelDevicePort::attach(tools);
    let port = Arc::new(port);
    let invocations = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&invocations);
    tokio::spawn(async move {
        // Frames held here keep reply senders alive for `Never`.
        let mut parked = Vec::new();
        while let Some((invocation, reply)) = conn.next_invocation().await {
            counter.fetch_add(1, Ordering::SeqCst);
            match &behavior {
                DeviceBehavior::ReplyFile => {
                    let _ = reply.send(fleetlink::device::ToolReply {
                        correlation_id: invocation.correlation_id,
                        success: true,
                        message: String::new(),
                        parts: vec![Part::file_uri(
                            "blob://captures/latest.jpg",
                            Some("image/jpeg".to_string()),
                        )],
                    });
                }
                DeviceBehavior::ReplyText(text) => {
                    let _ = reply.send(fleetlink::device::ToolReply {
                        correlation_id: invocation.correlation_id,
                        success: true,
                        message: String::new(),
                        parts: vec![Part::text(text.clone())],
                    });
                }
                DeviceBehavior::Fail(message) => {
                    let _ = reply.send(fleetlink::device::ToolReply {
                        correlation_id: invocation.correlation_id,
                        success: false,
                        message: message.clone(),
                        parts: vec![],
                    });
                }
                DeviceBehavior::Never => {
                    parked.push(reply);
                }
            }
        }
    });

    TestDevice { port, invocations }
}

/// Spawn and register a camera device on the broker.
pub async fn register_camera(
    broker: &Arc<Broker>,
    device_id: &str,
    behavior: DeviceBehavior,
) -> TestDevice {
    let device = spawn_device(vec![capture_tool()], behavior);
    broker
        .registry()
        .register(camera_spec(device_id), device.port.clone())
        .await
        .expect("register device");
    device
}

/// The camera device spec used by the scenario suites.
pub fn camera_spec(device_id: &str) -> DeviceSpec {
    DeviceSpec {
        device_id: device_id.to_string(),
        display_name: format!("{} camera", device_id),
        kind: "camera".to_string(),
        endpoint: serde_json::json!({"channel": device_id}),
        intent_keywords: vec!["photo".to_string(), "picture".to_string()],
        system_prompt: None,
    }
}

// ---------------------------------------------------------------------------
// Scripted LLM
// ---------------------------------------------------------------------------

/// An [`LlmPort`] that always answers with a fixed analysis.
pub struct ScriptedLlm(pub RouteAnalysis);

#[async_trait]
impl LlmPort for ScriptedLlm {
    async fn analyze(
        &self,
        _prompt: &str,
        _context: &AnalysisContext,
    ) -> BrokerResult<RouteAnalysis> {
        Ok(self.0.clone())
    }
}

/// An [`LlmPort`] answering from a sequence; the last analysis repeats.
pub struct SequenceLlm(pub Mutex<Vec<RouteAnalysis>>);

impl SequenceLlm {
    pub fn new(sequence: Vec<RouteAnalysis>) -> Self {
        Self(Mutex::new(sequence))
    }
}

#[async_trait]
impl LlmPort for SequenceLlm {
    async fn analyze(
        &self,
        _prompt: &str,
        _context: &AnalysisContext,
    ) -> BrokerResult<RouteAnalysis> {
        let mut sequence = self.0.lock().await;
        if sequence.len() > 1 {
            Ok(sequence.remove(0))
        } else {
            sequence
                .first()
                .cloned()
                .ok_or_else(|| fleetlink::BrokerError::internal_error("empty analysis sequence"))
        }
    }
}

// ---------------------------------------------------------------------------
// Push receiver
// ---------------------------------------------------------------------------

/// One captured push delivery.
#[derive(Debug, Clone)]
pub struct CapturedPush {
    pub delivery_id: Option<String>,
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

/// A callback endpoint that records deliveries and answers from a scripted
/// status sequence (the last status repeats).
pub struct PushReceiver {
    pub url: String,
    captured: Arc<Mutex<Vec<CapturedPush>>>,
}

struct PushState {
    captured: Arc<Mutex<Vec<CapturedPush>>>,
    statuses: Mutex<Vec<u16>>,
}

impl PushReceiver {
    /// Spawn a receiver answering with `statuses` in order.
    pub async fn spawn(statuses: Vec<u16>) -> Self {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(PushState {
            captured: Arc::clone(&captured),
            statuses: Mutex::new(statuses),
        });

        let app = Router::new()
            .route("/callback", post(capture_push))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind push receiver");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self {
            url: format!("http://{}/callback", addr),
            captured,
        }
    }

    pub async fn captured(&self) -> Vec<CapturedPush> {
        self.captured.lock().await.clone()
    }

    /// Wait until at least `count` deliveries have arrived (bounded).
    pub async fn wait_for(&self, count: usize, timeout: std::time::Duration) -> Vec<CapturedPush> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let captured = self.captured().await;
            if captured.len() >= count {
                return captured;
            }
            if tokio::time::Instant::now() >= deadline {
                return captured;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

async fn capture_push(
    State(state): State<Arc<PushState>>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let status = {
        let mut statuses = state.statuses.lock().await;
        if statuses.len() > 1 {
            statuses.remove(0)
        } else {
            statuses.first().copied().unwrap_or(200)
        }
    };

    state.captured.lock().await.push(CapturedPush {
        delivery_id: headers
            .get("x-delivery-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        body: serde_json::from_str(&body).unwrap_or(serde_json::Value::Null),
    });

    StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
}
