//! Device tool port — the narrow interface the broker holds per device.
//!
//! Two operations: discover the declared tool surface, and invoke one tool
//! with a correlation id and a cancellation token. The reference
//! implementation, [`ChannelDevicePort`], speaks over an in-process channel
//! pair shaped like the device ingress contract: the broker writes
//! `invoke(toolId, arguments, correlationId)` frames and reads correlated
//! replies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::types::Part;

/// A tool declared by a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Tool identifier, unique within its device.
    pub tool_id: String,

    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON schema of the tool's input.
    #[serde(default)]
    pub input_schema: serde_json::Value,

    /// JSON schema of the tool's output.
    #[serde(default)]
    pub output_schema: serde_json::Value,

    /// Per-tool invocation timeout override, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Media types the tool's output should be advertised as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_modes: Option<Vec<String>>,
}

impl ToolDescriptor {
    /// Names of the required input properties declared by the schema.
    pub fn required_inputs(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

/// The result of a tool invocation, expressed as message/artifact parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    /// Content parts produced by the tool.
    pub parts: Vec<Part>,

    /// Optional structured metadata about the invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Abstract capability-discovery + tool-call interface to one device.
#[async_trait]
pub trait DeviceToolPort: Send + Sync {
    /// Probe the device and return its declared tool list.
    ///
    /// Called at registration to verify reachability and ingest the
    /// surface; may be called again to refresh it.
    async fn discover_tools(&self) -> BrokerResult<Vec<ToolDescriptor>>;

    /// Invoke a tool. Implementations must return promptly once `cancel`
    /// fires, without waiting for the device.
    async fn invoke(
        &self,
        tool_id: &str,
        arguments: serde_json::Value,
        correlation_id: &str,
        cancel: CancellationToken,
    ) -> BrokerResult<ToolOutcome>;
}

// ---------------------------------------------------------------------------
// Channel-backed port
// ---------------------------------------------------------------------------

/// An invocation frame written to the device channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    /// Correlation id echoed in the reply.
    pub correlation_id: String,

    /// Tool to execute.
    pub tool_id: String,

    /// Tool arguments as JSON.
    pub arguments: serde_json::Value,
}

/// A reply frame read from the device channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolReply {
    /// Matches the invocation's correlation id.
    pub correlation_id: String,

    /// Whether the tool call succeeded on the device.
    pub success: bool,

    /// Human-readable result or error message.
    #[serde(default)]
    pub message: String,

    /// Result content parts (empty on failure).
    #[serde(default)]
    pub parts: Vec<Part>,
}

type InvocationFrame = (ToolInvocation, oneshot::Sender<ToolReply>);

/// Device-side end of a [`ChannelDevicePort`].
///
/// Whatever serves the device's long-lived connection reads invocation
/// frames from here and answers each through its reply sender.
pub struct DeviceConnection {
    rx: mpsc::Receiver<InvocationFrame>,
}

impl DeviceConnection {
    /// Receive the next invocation frame, or `None` when the broker side
    /// has dropped the port.
    pub async fn next_invocation(&mut self) -> Option<InvocationFrame> {
        self.rx.recv().await
    }
}

/// [`DeviceToolPort`] backed by an in-process channel pair.
///
/// `invoke` writes a correlated frame and awaits the reply; discovery
/// returns the tool list declared when the channel was attached.
#[derive(Clone)]
pub struct ChannelDevicePort {
    tools: Vec<ToolDescriptor>,
    tx: mpsc::Sender<InvocationFrame>,
}

impl ChannelDevicePort {
    /// Create a port/connection pair for a device declaring `tools`.
    pub fn attach(tools: Vec<ToolDescriptor>) -> (Self, DeviceConnection) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tools, tx }, DeviceConnection { rx })
    }
}

#[async_trait]
impl DeviceToolPort for ChannelDevicePort {
    async fn discover_tools(&self) -> BrokerResult<Vec<ToolDescriptor>> {
        if self.tx.is_closed() {
            return Err(BrokerError::DeviceGone(
                "device channel is closed".to_string(),
            ));
        }
        Ok(self.tools.clone())
    }

    async fn invoke(
        &self,
        tool_id: &str,
        arguments: serde_json::Value,
        correlation_id: &str,
        cancel: CancellationToken,
    ) -> BrokerResult<ToolOutcome> {
        if !self.tools.iter().any(|t| t.tool_id == tool_id) {
            return Err(BrokerError::unsupported_operation(format!(
                "device does not declare tool '{}'",
                tool_id
            )));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let frame = ToolInvocation {
            correlation_id: correlation_id.to_string(),
            tool_id: tool_id.to_string(),
            arguments,
        };

        debug!(correlation_id = %correlation_id, tool_id = %tool_id, "Dispatching tool invocation");

        self.tx.send((frame, reply_tx)).await.map_err(|_| {
            BrokerError::DeviceGone("device channel closed before dispatch".to_string())
        })?;

        let reply = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(correlation_id = %correlation_id, "Tool invocation canceled");
                return Err(BrokerError::Other("invocation canceled".to_string()));
            }
            reply = reply_rx => reply.map_err(|_| {
                BrokerError::DeviceGone("device dropped the invocation".to_string())
            })?,
        };

        if reply.correlation_id != correlation_id {
            warn!(
                expected = %correlation_id,
                got = %reply.correlation_id,
                "Correlation id mismatch on tool reply"
            );
            return Err(BrokerError::internal_error(
                "correlation id mismatch on tool reply",
            ));
        }

        if !reply.success {
            return Err(BrokerError::internal_error(format!(
                "tool '{}' failed on device: {}",
                tool_id, reply.message
            )));
        }

        Ok(ToolOutcome {
            parts: reply.parts,
            metadata: None,
        })
    }
}
