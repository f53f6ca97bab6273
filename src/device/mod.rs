//! Device model, tool port, registry, and capability manifest assembly.

pub mod manifest;
pub mod port;
pub mod registry;

pub use manifest::{ManifestBuilder, ManifestCache, ServiceIdentity};
pub use port::{ChannelDevicePort, DeviceConnection, DeviceToolPort, ToolDescriptor, ToolInvocation, ToolOutcome, ToolReply};
pub use registry::{DeviceFilter, DeviceRegistry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness state of a registered device.
///
/// A device with no heartbeat for H seconds drops to `Unknown`, and to
/// `Offline` after 2H. Ordering is by desirability: online first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Heartbeating normally.
    Online,
    /// Missed at least one heartbeat window.
    Unknown,
    /// Considered unreachable.
    Offline,
}

impl Liveness {
    /// Rank for intent-match ordering: online > unknown > offline.
    pub fn rank(&self) -> u8 {
        match self {
            Liveness::Online => 2,
            Liveness::Unknown => 1,
            Liveness::Offline => 0,
        }
    }
}

/// A registered end device and its declared tool surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Unique device identifier.
    pub device_id: String,

    /// Human-readable display name.
    pub display_name: String,

    /// Device kind tag (e.g. "camera", "sensor").
    pub kind: String,

    /// Opaque reference to the device's capability source endpoint.
    pub endpoint: serde_json::Value,

    /// Declared tools, ingested from the device's port at registration.
    pub tools: Vec<port::ToolDescriptor>,

    /// Intent keywords this device claims to handle.
    pub intent_keywords: Vec<String>,

    /// Last heartbeat or registration time.
    pub last_seen: DateTime<Utc>,

    /// Current liveness state.
    pub liveness: Liveness,

    /// Optional system prompt guiding LLM routing for this device's stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Device {
    /// Look up a declared tool by id.
    pub fn tool(&self, tool_id: &str) -> Option<&port::ToolDescriptor> {
        self.tools.iter().find(|t| t.tool_id == tool_id)
    }

    /// Count of lowercase keyword overlaps with the given token set.
    pub fn keyword_overlap(&self, tokens: &[String]) -> usize {
        self.intent_keywords
            .iter()
            .filter(|kw| {
                let kw = kw.to_lowercase();
                tokens.iter().any(|t| *t == kw)
            })
            .count()
    }
}

/// Registration request for a new device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    /// Unique device identifier.
    pub device_id: String,

    /// Human-readable display name.
    pub display_name: String,

    /// Device kind tag.
    pub kind: String,

    /// Opaque capability-source endpoint reference.
    #[serde(default)]
    pub endpoint: serde_json::Value,

    /// Intent keywords.
    #[serde(default)]
    pub intent_keywords: Vec<String>,

    /// Optional system prompt for stream-originated routing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Patch of the mutable device fields.
///
/// `None` leaves the field untouched. Identity, kind, endpoint, and the
/// tool list are registry-owned and not patchable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePatch {
    /// New display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Replacement intent keywords.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_keywords: Option<Vec<String>>,

    /// Replacement system prompt (`Some("")` clears it).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}
