//! Capability manifest assembly — the public agent card derived from the
//! registry.
//!
//! The card is rebuilt off the registry's invalidation signal and swapped
//! in whole behind an `Arc`, so readers never observe a partially built
//! document. Rebuild requests are coalesced: the signal holds at most one
//! pending permit while a rebuild is in flight.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{
    AgentCapabilities, AgentCard, AgentInterface, AgentProvider, AgentSkill, SecurityScheme,
};

use super::registry::DeviceRegistry;
use super::{Device, Liveness};

/// Protocol version advertised on the card.
pub const PROTOCOL_VERSION: &str = "0.3.0";

/// Static identity of this broker deployment.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    /// Service name.
    pub name: String,

    /// Service description.
    pub description: String,

    /// Service version.
    pub version: String,

    /// Primary endpoint URL.
    pub url: String,

    /// Additional transport interfaces beyond the primary JSON-RPC one.
    pub additional_interfaces: Vec<AgentInterface>,

    /// Optional provider info.
    pub provider: Option<AgentProvider>,

    /// Declared security schemes.
    pub security_schemes: Option<HashMap<String, SecurityScheme>>,
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self {
            name: "fleetlink".to_string(),
            description: "Broker between tool-bearing end devices and A2A agents".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            url: "http://localhost:7420/a2a".to_string(),
            additional_interfaces: Vec::new(),
            provider: None,
            security_schemes: None,
        }
    }
}

/// Assembles agent cards from registry snapshots.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    identity: ServiceIdentity,
    capabilities: AgentCapabilities,
}

impl ManifestBuilder {
    /// Create a builder with the given identity and capability flags.
    pub fn new(identity: ServiceIdentity, capabilities: AgentCapabilities) -> Self {
        Self {
            identity,
            capabilities,
        }
    }

    /// Build a card from the given device snapshot.
    ///
    /// Skills are the built-in broker skills plus one synthesized skill
    /// per **online** device, tagged with its intent keywords.
    pub fn build(&self, devices: &[Device]) -> AgentCard {
        let mut skills = vec![AgentSkill {
            id: "broker-chat".to_string(),
            name: "Broker chat".to_string(),
            description: "Answer requests directly or route them to the right device or agent"
                .to_string(),
            tags: vec!["chat".to_string(), "routing".to_string()],
            examples: None,
            input_modes: Some(vec!["text/plain".to_string()]),
            output_modes: Some(vec!["text/plain".to_string()]),
        }];

        for device in devices {
            if device.liveness != Liveness::Online {
                continue;
            }
            skills.push(Self::device_skill(device));
        }

        AgentCard {
            name: self.identity.name.clone(),
            description: self.identity.description.clone(),
            version: self.identity.version.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            url: self.identity.url.clone(),
            preferred_transport: "JSONRPC".to_string(),
            additional_interfaces: self.identity.additional_interfaces.clone(),
            provider: self.identity.provider.clone(),
            capabilities: self.capabilities.clone(),
            security_schemes: self.identity.security_schemes.clone(),
            default_input_modes: vec!["text/plain".to_string(), "application/json".to_string()],
            default_output_modes: vec!["text/plain".to_string(), "application/json".to_string()],
            skills,
        }
    }

    fn device_skill(device: &Device) -> AgentSkill {
        let mut output_modes: Vec<String> = vec!["application/json".to_string()];
        for tool in &device.tools {
            if let Some(ref modes) = tool.output_modes {
                for mode in modes {
                    if !output_modes.contains(mode) {
                        output_modes.push(mode.clone());
                    }
                }
            }
        }

        let tool_names: Vec<&str> = device.tools.iter().map(|t| t.tool_id.as_str()).collect();
        AgentSkill {
            id: format!("device:{}", device.device_id),
            name: device.display_name.clone(),
            description: format!(
                "Tools exposed by device '{}' ({}): {}",
                device.device_id,
                device.kind,
                tool_names.join(", ")
            ),
            tags: device.intent_keywords.clone(),
            examples: None,
            input_modes: Some(vec![
                "text/plain".to_string(),
                "application/json".to_string(),
            ]),
            output_modes: Some(output_modes),
        }
    }
}

/// Cached, atomically swapped agent card.
pub struct ManifestCache {
    current: RwLock<Arc<AgentCard>>,
}

impl ManifestCache {
    /// Initialize the cache with a freshly built card.
    pub fn new(initial: AgentCard) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// The current card. Cheap; clones an `Arc`.
    pub async fn load(&self) -> Arc<AgentCard> {
        self.current.read().await.clone()
    }

    /// Swap in a rebuilt card.
    pub async fn swap(&self, card: AgentCard) {
        *self.current.write().await = Arc::new(card);
    }

    /// Spawn the rebuild loop: waits on the registry's invalidation signal,
    /// rebuilds from a fresh snapshot, and swaps. Runs until `cancel` fires.
    pub fn spawn_rebuilder(
        self: Arc<Self>,
        builder: ManifestBuilder,
        registry: Arc<DeviceRegistry>,
        signal: Arc<Notify>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = signal.notified() => {
                        let snapshot = registry.snapshot().await;
                        let card = builder.build(&snapshot);
                        debug!(skills = card.skills.len(), "Capability manifest rebuilt");
                        self.swap(card).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::port::ToolDescriptor;
    use chrono::Utc;
    use serde_json::json;

    fn device(id: &str, liveness: Liveness, keywords: &[&str]) -> Device {
        Device {
            device_id: id.to_string(),
            display_name: format!("{} device", id),
            kind: "camera".to_string(),
            endpoint: json!({}),
            tools: vec![ToolDescriptor {
                tool_id: "capture_image".to_string(),
                description: None,
                input_schema: json!({}),
                output_schema: json!({}),
                timeout_secs: None,
                output_modes: Some(vec!["image/jpeg".to_string()]),
            }],
            intent_keywords: keywords.iter().map(|s| s.to_string()).collect(),
            last_seen: Utc::now(),
            liveness,
            system_prompt: None,
        }
    }

    fn builder() -> ManifestBuilder {
        ManifestBuilder::new(
            ServiceIdentity::default(),
            AgentCapabilities {
                streaming: Some(true),
                push_notifications: Some(true),
                state_transition_history: Some(true),
            },
        )
    }

    #[test]
    fn card_includes_skill_per_online_device() {
        let devices = vec![
            device("cam-1", Liveness::Online, &["photo", "picture"]),
            device("cam-2", Liveness::Offline, &["photo"]),
        ];
        let card = builder().build(&devices);

        let skill = card
            .skills
            .iter()
            .find(|s| s.id == "device:cam-1")
            .expect("cam-1 skill missing");
        assert!(skill.tags.contains(&"photo".to_string()));
        assert!(skill.description.contains("cam-1"));
        assert!(skill
            .output_modes
            .as_ref()
            .unwrap()
            .contains(&"image/jpeg".to_string()));

        assert!(!card.skills.iter().any(|s| s.id == "device:cam-2"));
    }

    #[test]
    fn card_carries_capability_flags_and_transport() {
        let card = builder().build(&[]);
        assert_eq!(card.preferred_transport, "JSONRPC");
        assert_eq!(card.protocol_version, PROTOCOL_VERSION);
        assert_eq!(card.capabilities.streaming, Some(true));
        assert_eq!(card.capabilities.push_notifications, Some(true));
        // The built-in broker skill is always present.
        assert!(card.skills.iter().any(|s| s.id == "broker-chat"));
    }

    #[tokio::test]
    async fn cache_swaps_whole_documents() {
        let b = builder();
        let cache = ManifestCache::new(b.build(&[]));
        let before = cache.load().await;
        assert_eq!(before.skills.len(), 1);

        cache
            .swap(b.build(&[device("cam-1", Liveness::Online, &["photo"])]))
            .await;
        let after = cache.load().await;
        assert_eq!(after.skills.len(), 2);
        // The earlier snapshot is unaffected by the swap.
        assert_eq!(before.skills.len(), 1);
    }
}
