//! External agent endpoint registry.
//!
//! Endpoints are managed out-of-band (operator tooling writes them through
//! the repository); the broker reads them for delegation and tracks
//! per-endpoint health as last-success recency.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{BrokerError, BrokerResult};
use crate::repository::Repository;

/// A delegation target speaking A2A.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEndpoint {
    /// Unique agent identifier.
    pub agent_id: String,

    /// JSON-RPC endpoint URL.
    pub url: String,

    /// Capability tags used for routing tie-breaks.
    #[serde(default)]
    pub capability_tags: Vec<String>,

    /// Opaque reference to stored credentials for this endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_ref: Option<String>,

    /// Disabled endpoints are never selected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Time of the last successful delegation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl AgentEndpoint {
    /// Count of lowercase capability-tag overlaps with the given tokens.
    pub fn tag_overlap(&self, tokens: &[String]) -> usize {
        self.capability_tags
            .iter()
            .filter(|tag| {
                let tag = tag.to_lowercase();
                tokens.iter().any(|t| *t == tag)
            })
            .count()
    }
}

/// In-memory endpoint table with repository write-through.
pub struct AgentEndpointRegistry {
    endpoints: RwLock<HashMap<String, AgentEndpoint>>,
    repository: Arc<dyn Repository>,
}

impl AgentEndpointRegistry {
    /// Create an empty registry writing through to `repository`.
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            repository,
        }
    }

    /// Rehydrate the table from the repository.
    pub async fn hydrate(&self) -> BrokerResult<()> {
        let stored = self.repository.list_endpoints().await?;
        let mut endpoints = self.endpoints.write().await;
        for endpoint in stored {
            endpoints.insert(endpoint.agent_id.clone(), endpoint);
        }
        info!(count = endpoints.len(), "Agent endpoint table hydrated");
        Ok(())
    }

    /// Add or replace an endpoint.
    pub async fn upsert(&self, endpoint: AgentEndpoint) -> BrokerResult<()> {
        self.repository.save_endpoint(endpoint.clone()).await?;
        self.endpoints
            .write()
            .await
            .insert(endpoint.agent_id.clone(), endpoint);
        Ok(())
    }

    /// Remove an endpoint.
    pub async fn remove(&self, agent_id: &str) -> BrokerResult<()> {
        let removed = self.endpoints.write().await.remove(agent_id);
        if removed.is_none() {
            return Err(BrokerError::invalid_params(format!(
                "unknown agent endpoint '{}'",
                agent_id
            )));
        }
        self.repository.delete_endpoint(agent_id).await
    }

    /// Look up an endpoint by id.
    pub async fn get(&self, agent_id: &str) -> Option<AgentEndpoint> {
        self.endpoints.read().await.get(agent_id).cloned()
    }

    /// All enabled endpoints.
    pub async fn enabled(&self) -> Vec<AgentEndpoint> {
        let mut out: Vec<AgentEndpoint> = self
            .endpoints
            .read()
            .await
            .values()
            .filter(|e| e.enabled)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// Record a successful delegation to `agent_id`.
    pub async fn record_success(&self, agent_id: &str) {
        let updated = {
            let mut endpoints = self.endpoints.write().await;
            match endpoints.get_mut(agent_id) {
                Some(endpoint) => {
                    endpoint.last_success = Some(Utc::now());
                    Some(endpoint.clone())
                }
                None => None,
            }
        };
        if let Some(endpoint) = updated {
            debug!(agent_id = %agent_id, "Recorded delegation success");
            let _ = self.repository.save_endpoint(endpoint).await;
        }
    }
}
