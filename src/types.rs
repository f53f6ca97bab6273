//! A2A protocol types used on the broker's wire surface.
//!
//! Everything here serializes to the camelCase JSON-RPC wire format.
//! Unions (message parts, stream events, send responses) are discriminated
//! by a `kind` field.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Enums
// ============================================================================

/// The lifecycle state of a task.
///
/// Serialized as kebab-case strings (`"input-required"`, `"auth-required"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Task has been received but not yet started.
    Submitted,
    /// Task is actively being processed.
    Working,
    /// Task requires additional input from the user.
    InputRequired,
    /// Task requires authentication before it can proceed.
    AuthRequired,
    /// Task completed successfully.
    Completed,
    /// Task failed.
    Failed,
    /// Task was canceled.
    Canceled,
    /// Task was rejected without being started.
    Rejected,
}

impl TaskState {
    /// Terminal states are absorbing: no further transitions are accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled | TaskState::Rejected
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::InputRequired => "input-required",
            TaskState::AuthRequired => "auth-required",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
            TaskState::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from the user / client side.
    User,
    /// Message produced by the service or a device on its behalf.
    Agent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Agent => write!(f, "agent"),
        }
    }
}

// ============================================================================
// Core Task Types
// ============================================================================

/// Current status of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// The current state.
    pub state: TaskState,

    /// Optional message associated with this status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,

    /// ISO-8601 timestamp of when this status was set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A task — the primary unit of work on the broker surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier (server-generated).
    pub id: String,

    /// Context identifier grouping related tasks/messages.
    pub context_id: String,

    /// Discriminator field — always "task".
    #[serde(default = "kind_task")]
    pub kind: String,

    /// Current task status.
    pub status: TaskStatus,

    /// Artifacts produced by the task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Artifact>>,

    /// Message history for this task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<Message>>,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// Message & Parts
// ============================================================================

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message identifier.
    pub message_id: String,

    /// Who sent this message.
    pub role: Role,

    /// Discriminator field — always "message".
    #[serde(default = "kind_message")]
    pub kind: String,

    /// Content parts of the message.
    pub parts: Vec<Part>,

    /// Context this message belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Task this message is associated with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// IDs of tasks referenced by this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_task_ids: Option<Vec<String>>,
}

impl Message {
    /// Build a user message with a single text part and a fresh id.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    /// Build an agent message with a single text part and a fresh id.
    pub fn agent_text(text: impl Into<String>) -> Self {
        Self::text(Role::Agent, text)
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Message {
            message_id: uuid::Uuid::new_v4().to_string(),
            role,
            kind: "message".to_string(),
            parts: vec![Part::text(text)],
            context_id: None,
            task_id: None,
            metadata: None,
            reference_task_ids: None,
        }
    }

    /// All text content of this message, parts joined with newlines.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// File content provided as base64-encoded bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWithBytes {
    /// Base64-encoded file content.
    pub bytes: String,
    /// MIME type of the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Optional file name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// File content provided as a URI reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWithUri {
    /// URI pointing to the file content.
    pub uri: String,
    /// MIME type of the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Optional file name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// File content — either inline bytes or a URI reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileContent {
    /// File with inline base64-encoded bytes.
    Bytes(FileWithBytes),
    /// File referenced by URI.
    Uri(FileWithUri),
}

/// A content part within a message or artifact.
///
/// Wire format, discriminated by `kind`:
/// - `{"kind": "text", "text": "hello"}`
/// - `{"kind": "file", "file": {"bytes": "...", "mimeType": "image/png"}}`
/// - `{"kind": "file", "file": {"uri": "https://...", "mimeType": "application/pdf"}}`
/// - `{"kind": "data", "data": {"key": "value"}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Part {
    /// A text content part. Discriminator: `"text"`.
    #[serde(rename = "text")]
    Text {
        /// The text content.
        text: String,
        /// Optional metadata associated with this part.
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    /// A file content part. Discriminator: `"file"`.
    #[serde(rename = "file")]
    File {
        /// The file content (bytes or URI).
        file: FileContent,
        /// Optional metadata associated with this part.
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    /// A structured data content part. Discriminator: `"data"`.
    #[serde(rename = "data")]
    Data {
        /// Arbitrary structured data.
        data: serde_json::Value,
        /// Optional metadata associated with this part.
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
}

impl Part {
    /// A text part without metadata.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            metadata: None,
        }
    }

    /// A structured data part without metadata.
    pub fn data(data: serde_json::Value) -> Self {
        Part::Data {
            data,
            metadata: None,
        }
    }

    /// A file part referencing content by URI.
    pub fn file_uri(uri: impl Into<String>, mime_type: Option<String>) -> Self {
        Part::File {
            file: FileContent::Uri(FileWithUri {
                uri: uri.into(),
                mime_type,
                name: None,
            }),
            metadata: None,
        }
    }

    /// A file part carrying inline base64 bytes.
    pub fn file_bytes(bytes: impl Into<String>, mime_type: Option<String>) -> Self {
        Part::File {
            file: FileContent::Bytes(FileWithBytes {
                bytes: bytes.into(),
                mime_type,
                name: None,
            }),
            metadata: None,
        }
    }
}

/// An artifact produced by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Artifact identifier, unique within its task.
    pub artifact_id: String,

    /// Human-readable name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Description of the artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Content parts of the artifact.
    pub parts: Vec<Part>,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// Streaming Events
// ============================================================================

/// Notification that a task's status has changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdateEvent {
    /// ID of the task whose status changed.
    pub task_id: String,

    /// Context this task belongs to.
    pub context_id: String,

    /// Discriminator field — always "status-update".
    #[serde(default = "kind_status_update")]
    pub kind: String,

    /// The new status.
    pub status: TaskStatus,

    /// Whether this is the final event for this task. Streams close after
    /// the first event with `final=true`.
    #[serde(rename = "final")]
    pub r#final: bool,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Notification that an artifact has been created or extended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskArtifactUpdateEvent {
    /// ID of the task that produced the artifact.
    pub task_id: String,

    /// Context this task belongs to.
    pub context_id: String,

    /// Discriminator field — always "artifact-update".
    #[serde(default = "kind_artifact_update")]
    pub kind: String,

    /// The artifact (or chunk of one).
    pub artifact: Artifact,

    /// When `true`, the parts extend the existing artifact with the same id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub append: Option<bool>,

    /// When `true`, this chunk seals the artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_chunk: Option<bool>,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn kind_task() -> String {
    "task".to_string()
}

fn kind_message() -> String {
    "message".to_string()
}

fn kind_status_update() -> String {
    "status-update".to_string()
}

fn kind_artifact_update() -> String {
    "artifact-update".to_string()
}

/// A streaming event payload.
///
/// Serializes FLAT (no wrapper keys) — the inner `kind` field is the
/// discriminator: `"task"`, `"message"`, `"status-update"`,
/// `"artifact-update"`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A complete task snapshot.
    Task(Task),

    /// A direct message.
    Message(Message),

    /// A task status update event.
    StatusUpdate(TaskStatusUpdateEvent),

    /// An artifact update event.
    ArtifactUpdate(TaskArtifactUpdateEvent),
}

impl StreamEvent {
    /// Whether this event terminates its task's stream.
    pub fn is_final(&self) -> bool {
        match self {
            StreamEvent::StatusUpdate(update) => update.r#final,
            StreamEvent::Task(task) => task.status.state.is_terminal(),
            StreamEvent::Message(_) => true,
            StreamEvent::ArtifactUpdate(_) => false,
        }
    }
}

impl Serialize for StreamEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StreamEvent::Task(inner) => inner.serialize(serializer),
            StreamEvent::Message(inner) => inner.serialize(serializer),
            StreamEvent::StatusUpdate(inner) => inner.serialize(serializer),
            StreamEvent::ArtifactUpdate(inner) => inner.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for StreamEvent {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| serde::de::Error::custom("missing 'kind' field"))?;

        match kind {
            "task" => {
                let task: Task = serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(StreamEvent::Task(task))
            }
            "message" => {
                let msg: Message =
                    serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(StreamEvent::Message(msg))
            }
            "status-update" => {
                let event: TaskStatusUpdateEvent =
                    serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(StreamEvent::StatusUpdate(event))
            }
            "artifact-update" => {
                let event: TaskArtifactUpdateEvent =
                    serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(StreamEvent::ArtifactUpdate(event))
            }
            other => Err(serde::de::Error::custom(format!(
                "unknown kind '{}' — expected one of: task, message, status-update, artifact-update",
                other
            ))),
        }
    }
}

// ============================================================================
// Agent Card
// ============================================================================

fn default_protocol_version() -> String {
    "0.3.0".to_string()
}

fn default_preferred_transport() -> String {
    "JSONRPC".to_string()
}

/// Self-describing capability manifest for the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    /// Human-readable service name.
    pub name: String,

    /// Description of what the service brokers.
    pub description: String,

    /// Service version string.
    pub version: String,

    /// Protocol version advertised to peers.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Primary endpoint URL.
    pub url: String,

    /// Preferred transport protocol (e.g. "JSONRPC").
    #[serde(default = "default_preferred_transport")]
    pub preferred_transport: String,

    /// Additional transport interfaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_interfaces: Vec<AgentInterface>,

    /// Service provider information.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<AgentProvider>,

    /// Capability flags.
    pub capabilities: AgentCapabilities,

    /// Named security scheme declarations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_schemes: Option<HashMap<String, SecurityScheme>>,

    /// Default MIME types accepted as input.
    pub default_input_modes: Vec<String>,

    /// Default MIME types produced as output.
    pub default_output_modes: Vec<String>,

    /// Skills: built-in service skills plus one per online device.
    pub skills: Vec<AgentSkill>,
}

/// A transport interface supported by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInterface {
    /// URL of the interface endpoint.
    pub url: String,

    /// Transport protocol name (e.g. "JSONRPC", "HTTP+JSON", "GRPC").
    pub transport: String,
}

/// Capability flags advertised on the card.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    /// Whether streaming responses (SSE) are supported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,

    /// Whether push notifications are supported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_notifications: Option<bool>,

    /// Whether state transition history is recorded on tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_transition_history: Option<bool>,
}

/// A skill advertised on the card.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSkill {
    /// Unique skill identifier.
    pub id: String,

    /// Human-readable skill name.
    pub name: String,

    /// Description of what the skill does.
    pub description: String,

    /// Categorization tags (intent keywords for device-derived skills).
    pub tags: Vec<String>,

    /// Example prompts/inputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub examples: Option<Vec<String>>,

    /// MIME types this skill accepts as input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_modes: Option<Vec<String>>,

    /// MIME types this skill produces as output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_modes: Option<Vec<String>>,
}

/// Information about the service provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProvider {
    /// Organization name.
    pub organization: String,

    /// Organization URL.
    pub url: String,
}

/// Location for an API key (header, query, cookie).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    /// API key sent as a cookie.
    Cookie,
    /// API key sent in an HTTP header.
    Header,
    /// API key sent as a query parameter.
    Query,
}

/// A security scheme declaration, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SecurityScheme {
    /// API key authentication.
    #[serde(rename = "apiKey")]
    ApiKey {
        /// Optional description.
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// Where the API key is sent.
        #[serde(rename = "in")]
        location: ApiKeyLocation,
        /// Name of the API key parameter.
        name: String,
    },
    /// HTTP authentication (Bearer, Basic, etc.).
    #[serde(rename = "http")]
    Http {
        /// Optional description.
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// Authentication scheme name (e.g. "bearer").
        scheme: String,
        /// Format of the bearer token.
        #[serde(skip_serializing_if = "Option::is_none", rename = "bearerFormat")]
        bearer_format: Option<String>,
    },
    /// OpenID Connect authentication.
    #[serde(rename = "openIdConnect")]
    OpenIdConnect {
        /// Optional description.
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// OpenID Connect discovery URL.
        #[serde(rename = "openIdConnectUrl")]
        open_id_connect_url: String,
    },
}

// ============================================================================
// JSON-RPC envelope
// ============================================================================

/// A JSON-RPC 2.0 request id (string or number).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    /// String id.
    String(String),
    /// Numeric id.
    Number(i64),
}

/// A JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always "2.0".
    pub jsonrpc: String,

    /// Request id. Absent only for notifications (push delivery).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,

    /// Method name, `{category}/{action}`.
    pub method: String,

    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// A JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always "2.0".
    pub jsonrpc: String,

    /// Echoed request id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,

    /// Success payload (mutually exclusive with `error`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Error payload (mutually exclusive with `result`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,

    /// Human-readable message.
    pub message: String,

    /// Optional structured error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ============================================================================
// Method parameters
// ============================================================================

/// Parameters for `message/send` and `message/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageParams {
    /// The message to process.
    pub message: Message,

    /// Optional configuration for this send.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<SendMessageConfiguration>,

    /// Optional request metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Configuration options accompanying a send.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageConfiguration {
    /// Accepted output MIME types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_output_modes: Option<Vec<String>>,

    /// If `true`, the server blocks until the task reaches a terminal or
    /// input-required state (bounded by the request deadline).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking: Option<bool>,

    /// Maximum number of history messages to include in the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_length: Option<usize>,

    /// Push notification configuration to register for the created task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_notification_config: Option<PushNotificationConfig>,
}

/// Parameters for `tasks/get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTaskParams {
    /// The task ID to retrieve.
    pub id: String,

    /// Maximum number of history messages to include.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_length: Option<usize>,
}

/// Parameters carrying only a task ID (`tasks/cancel`, `tasks/resubscribe`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdParams {
    /// The task ID.
    pub id: String,

    /// Optional request metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Parameters for `tasks/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksParams {
    /// Filter tasks by context ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Filter tasks by state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Vec<TaskState>>,

    /// Maximum number of tasks per page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,

    /// Opaque token for pagination — the last task ID of the previous page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
}

/// Response for `tasks/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksResponse {
    /// The tasks matching the query.
    pub tasks: Vec<Task>,

    /// Token for the next page, if more results are available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Response to `message/send` — either a task or a direct message.
///
/// Discriminated on the wire by the inner `kind` field.
#[derive(Debug, Clone)]
pub enum SendMessageResponse {
    /// A task was created or continued.
    Task(Task),
    /// The request was answered directly with a message.
    Message(Message),
}

impl Serialize for SendMessageResponse {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SendMessageResponse::Task(inner) => inner.serialize(serializer),
            SendMessageResponse::Message(inner) => inner.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SendMessageResponse {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| serde::de::Error::custom("missing 'kind' field"))?;
        match kind {
            "task" => serde_json::from_value(value)
                .map(SendMessageResponse::Task)
                .map_err(serde::de::Error::custom),
            "message" => serde_json::from_value(value)
                .map(SendMessageResponse::Message)
                .map_err(serde::de::Error::custom),
            other => Err(serde::de::Error::custom(format!(
                "unknown kind '{}' — expected 'task' or 'message'",
                other
            ))),
        }
    }
}

// ============================================================================
// Push notifications
// ============================================================================

/// Authentication info attached to a push callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PushAuthentication {
    /// `Authorization: Bearer {token}`.
    Bearer {
        /// The bearer token.
        token: String,
    },
    /// Arbitrary headers attached verbatim.
    Headers {
        /// Header name/value pairs.
        headers: HashMap<String, String>,
    },
}

/// A client-supplied push notification callback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotificationConfig {
    /// Config identifier, unique per task. Server-generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Callback URL to POST event envelopes to.
    pub url: String,

    /// Optional authentication for the callback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<PushAuthentication>,
}

/// A push config bound to its task — the wire shape for the
/// `tasks/pushNotificationConfig/*` methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPushNotificationConfig {
    /// The owning task ID.
    pub task_id: String,

    /// The callback configuration.
    pub push_notification_config: PushNotificationConfig,
}

/// Parameters for `tasks/pushNotificationConfig/get` and `/delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConfigIdParams {
    /// The owning task ID.
    pub id: String,

    /// The config ID within the task.
    pub push_notification_config_id: String,
}

// ============================================================================
// Stream origin (scan-loop provenance)
// ============================================================================

/// Provenance key for tasks synthesized from a device stream entry.
///
/// Carried in message metadata under [`STREAM_ORIGIN_KEY`] so task creation
/// can be deduplicated per `(device_id, seq)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOrigin {
    /// The device whose stream produced the entry.
    pub device_id: String,

    /// The entry's sequence number.
    pub seq: u64,
}

/// Metadata key under which a [`StreamOrigin`] rides on internal messages.
pub const STREAM_ORIGIN_KEY: &str = "streamOrigin";

impl StreamOrigin {
    /// Attach this origin to a message's metadata.
    pub fn attach(&self, message: &mut Message) {
        let meta = message
            .metadata
            .get_or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if let Some(obj) = meta.as_object_mut() {
            obj.insert(
                STREAM_ORIGIN_KEY.to_string(),
                serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
            );
        }
    }

    /// Extract an origin from a message's metadata, if present.
    pub fn from_message(message: &Message) -> Option<Self> {
        message
            .metadata
            .as_ref()
            .and_then(|m| m.get(STREAM_ORIGIN_KEY))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&TaskState::InputRequired).unwrap(),
            "\"input-required\""
        );
        assert_eq!(
            serde_json::to_string(&TaskState::AuthRequired).unwrap(),
            "\"auth-required\""
        );
        assert_eq!(
            serde_json::from_str::<TaskState>("\"submitted\"").unwrap(),
            TaskState::Submitted
        );
    }

    #[test]
    fn terminal_states() {
        for state in [
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Canceled,
            TaskState::Rejected,
        ] {
            assert!(state.is_terminal());
        }
        for state in [
            TaskState::Submitted,
            TaskState::Working,
            TaskState::InputRequired,
            TaskState::AuthRequired,
        ] {
            assert!(!state.is_terminal());
        }
    }

    #[test]
    fn part_round_trips_by_kind() {
        let text = serde_json::to_value(Part::text("hello")).unwrap();
        assert_eq!(text["kind"], "text");

        let data = serde_json::to_value(Part::data(serde_json::json!({"a": 1}))).unwrap();
        assert_eq!(data["kind"], "data");

        let file = serde_json::to_value(Part::file_uri(
            "https://example.com/x.png",
            Some("image/png".to_string()),
        ))
        .unwrap();
        assert_eq!(file["kind"], "file");
        assert_eq!(file["file"]["mimeType"], "image/png");

        let parsed: Part = serde_json::from_value(file).unwrap();
        match parsed {
            Part::File {
                file: FileContent::Uri(f),
                ..
            } => assert_eq!(f.uri, "https://example.com/x.png"),
            other => panic!("expected uri file part, got {:?}", other),
        }
    }

    #[test]
    fn stream_event_flat_serialization() {
        let event = StreamEvent::StatusUpdate(TaskStatusUpdateEvent {
            task_id: "t1".to_string(),
            context_id: "c1".to_string(),
            kind: "status-update".to_string(),
            status: TaskStatus {
                state: TaskState::Working,
                message: None,
                timestamp: None,
            },
            r#final: false,
            metadata: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "status-update");
        assert_eq!(value["taskId"], "t1");
        assert_eq!(value["final"], false);

        let back: StreamEvent = serde_json::from_value(value).unwrap();
        match back {
            StreamEvent::StatusUpdate(u) => assert_eq!(u.status.state, TaskState::Working),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn send_message_response_discriminated_by_kind() {
        let msg = Message::agent_text("pong");
        let value = serde_json::to_value(SendMessageResponse::Message(msg)).unwrap();
        assert_eq!(value["kind"], "message");

        let parsed: SendMessageResponse = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed, SendMessageResponse::Message(_)));
    }

    #[test]
    fn stream_origin_attach_and_extract() {
        let mut msg = Message::user_text("motion detected");
        let origin = StreamOrigin {
            device_id: "cam-1".to_string(),
            seq: 42,
        };
        origin.attach(&mut msg);
        assert_eq!(StreamOrigin::from_message(&msg), Some(origin));

        let plain = Message::user_text("hello");
        assert_eq!(StreamOrigin::from_message(&plain), None);
    }

    #[test]
    fn message_text_content_joins_text_parts() {
        let mut msg = Message::user_text("line one");
        msg.parts.push(Part::data(serde_json::json!({"x": 1})));
        msg.parts.push(Part::text("line two"));
        assert_eq!(msg.text_content(), "line one\nline two");
    }
}
