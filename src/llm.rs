//! LLM port — the single `analyze` seam the intent router calls.
//!
//! The router builds the prompt; the port returns a structured routing
//! analysis. A chat-completions adapter for OpenAI-compatible APIs is
//! provided; tests use scripted implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};

/// The action an analysis recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    /// Answer inline, no device or agent involved.
    Local,
    /// Invoke a tool on a specific device.
    Device,
    /// Forward to an external agent.
    Delegate,
    /// Refuse the request.
    Reject,
}

/// Structured answer returned by [`LlmPort::analyze`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteAnalysis {
    /// Recommended action.
    pub action: RouteAction,

    /// Target id — a device id for `device`, an agent id for `delegate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Tool id on the target device, when `action == device`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    /// Arguments for the tool or forwarded request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,

    /// Confidence in [0, 1].
    pub confidence: f64,

    /// Free-text rationale (logged, never surfaced to clients).
    #[serde(default)]
    pub rationale: String,
}

/// Context handed to the model alongside the prompt.
///
/// Summaries only — the port must not need registry access.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisContext {
    /// One line per candidate device skill: id, keywords, tool schema summary.
    pub device_skills: Vec<String>,

    /// One line per external agent: id and capability tags.
    pub agents: Vec<String>,

    /// System prompt of the originating device, for stream-sourced inputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Abstract language-model backend.
#[async_trait]
pub trait LlmPort: Send + Sync {
    /// Analyze a prompt and return a structured routing decision.
    async fn analyze(&self, prompt: &str, context: &AnalysisContext)
        -> BrokerResult<RouteAnalysis>;
}

// ---------------------------------------------------------------------------
// Chat-completions adapter
// ---------------------------------------------------------------------------

/// Configuration for [`ChatCompletionsLlm`].
#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    /// API key, sent as a bearer token when present.
    pub api_key: Option<String>,

    /// Model identifier.
    pub model: String,

    /// Request timeout.
    pub timeout: Duration,

    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl Default for ChatCompletionsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(30),
            temperature: Some(0.0),
        }
    }
}

/// [`LlmPort`] adapter for OpenAI-compatible chat-completions endpoints.
///
/// Sends the analysis context as the system message and the prompt as the
/// user message, and expects the model to answer with a single JSON object
/// matching [`RouteAnalysis`].
pub struct ChatCompletionsLlm {
    client: reqwest::Client,
    base_url: String,
    config: ChatCompletionsConfig,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl ChatCompletionsLlm {
    /// Create an adapter targeting `{base_url}/v1/chat/completions`.
    pub fn new(base_url: impl Into<String>, config: ChatCompletionsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into(),
            config,
        }
    }

    fn system_message(context: &AnalysisContext) -> String {
        let mut out = String::from(
            "You route requests for a device broker. Answer with a single JSON \
             object: {\"action\": \"local\"|\"device\"|\"delegate\"|\"reject\", \
             \"target\": string?, \"tool\": string?, \"arguments\": object?, \
             \"confidence\": number, \"rationale\": string}.",
        );
        if let Some(ref sp) = context.system_prompt {
            out.push_str("\n\nDevice guidance: ");
            out.push_str(sp);
        }
        if !context.device_skills.is_empty() {
            out.push_str("\n\nAvailable device skills:\n");
            for skill in &context.device_skills {
                out.push_str("- ");
                out.push_str(skill);
                out.push('\n');
            }
        }
        if !context.agents.is_empty() {
            out.push_str("\nAvailable external agents:\n");
            for agent in &context.agents {
                out.push_str("- ");
                out.push_str(agent);
                out.push('\n');
            }
        }
        out
    }

    /// Extract the JSON object from a model answer that may wrap it in
    /// prose or a code fence.
    fn extract_json(content: &str) -> Option<&str> {
        let start = content.find('{')?;
        let end = content.rfind('}')?;
        (end > start).then(|| &content[start..=end])
    }
}

#[async_trait]
impl LlmPort for ChatCompletionsLlm {
    async fn analyze(
        &self,
        prompt: &str,
        context: &AnalysisContext,
    ) -> BrokerResult<RouteAnalysis> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: Self::system_message(context),
                },
                ChatMessage {
                    role: "user",
                    content: prompt.to_string(),
                },
            ],
            temperature: self.config.temperature,
        };

        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(&request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                BrokerError::Timeout(format!("LLM call to {} timed out", url))
            } else {
                BrokerError::Transport(format!("LLM request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidJson(format!("LLM response: {}", e)))?;

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| BrokerError::invalid_agent_response("LLM returned no choices"))?;

        let json = Self::extract_json(content).ok_or_else(|| {
            warn!(content = %content, "LLM answer contained no JSON object");
            BrokerError::invalid_agent_response("LLM answer contained no JSON object")
        })?;

        let analysis: RouteAnalysis = serde_json::from_str(json)
            .map_err(|e| BrokerError::InvalidJson(format!("LLM analysis: {}", e)))?;

        debug!(
            action = ?analysis.action,
            target = ?analysis.target,
            confidence = analysis.confidence,
            "LLM analysis parsed"
        );
        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_analysis_round_trips() {
        let json = r#"{
            "action": "device",
            "target": "cam-1",
            "tool": "capture_image",
            "arguments": {"resolution": "1080p"},
            "confidence": 0.92,
            "rationale": "photo intent"
        }"#;
        let analysis: RouteAnalysis = serde_json::from_str(json).unwrap();
        assert_eq!(analysis.action, RouteAction::Device);
        assert_eq!(analysis.target.as_deref(), Some("cam-1"));
        assert_eq!(analysis.tool.as_deref(), Some("capture_image"));
        assert!((analysis.confidence - 0.92).abs() < f64::EPSILON);
    }

    #[test]
    fn rationale_defaults_to_empty() {
        let json = r#"{"action": "local", "confidence": 1.0}"#;
        let analysis: RouteAnalysis = serde_json::from_str(json).unwrap();
        assert_eq!(analysis.action, RouteAction::Local);
        assert!(analysis.rationale.is_empty());
    }

    #[test]
    fn extract_json_from_fenced_answer() {
        let content = "Sure, here you go:\n```json\n{\"action\": \"local\", \"confidence\": 1.0}\n```";
        let json = ChatCompletionsLlm::extract_json(content).unwrap();
        let analysis: RouteAnalysis = serde_json::from_str(json).unwrap();
        assert_eq!(analysis.action, RouteAction::Local);
    }

    #[test]
    fn extract_json_rejects_proseless_garbage() {
        assert!(ChatCompletionsLlm::extract_json("no json here").is_none());
        assert!(ChatCompletionsLlm::extract_json("}{").is_none());
    }

    #[test]
    fn system_message_includes_skills_and_agents() {
        let context = AnalysisContext {
            device_skills: vec!["cam-1: photo, picture".to_string()],
            agents: vec!["translator: translation".to_string()],
            system_prompt: Some("Prefer snapshots over video.".to_string()),
        };
        let msg = ChatCompletionsLlm::system_message(&context);
        assert!(msg.contains("cam-1"));
        assert!(msg.contains("translator"));
        assert!(msg.contains("Prefer snapshots"));
    }
}
