//! Intent router — decides where an incoming message (or a stream entry)
//! should go: answer locally, invoke a device tool, delegate to an external
//! agent, or reject.
//!
//! The router is pure with respect to its inputs: given a fixed LLM
//! response, the same message, device snapshot, and endpoint table always
//! produce the same decision. The only I/O it performs is the LLM call.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::endpoints::AgentEndpoint;
use crate::device::port::ToolDescriptor;
use crate::device::{Device, Liveness};
use crate::llm::{AnalysisContext, LlmPort, RouteAction, RouteAnalysis};

/// Where the routed input came from.
#[derive(Debug, Clone)]
pub enum RouteOrigin {
    /// An inbound A2A request from a client or peer agent.
    Request,
    /// An entry observed on a device stream by the scan loop.
    DeviceStream {
        /// The originating device.
        device_id: String,
        /// The entry's sequence number.
        seq: u64,
        /// The device's system prompt, if any.
        system_prompt: Option<String>,
    },
}

/// The routed input: text plus provenance.
#[derive(Debug, Clone)]
pub struct RouteInput {
    /// Text to classify.
    pub text: String,

    /// Provenance of the input.
    pub origin: RouteOrigin,
}

/// A routing decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Answer inline; the task completes with this reply.
    Local {
        /// Reply text.
        reply: String,
    },
    /// Ask the user to clarify; the task parks in `input-required`.
    Clarify {
        /// Clarification question.
        question: String,
    },
    /// Invoke a specific device tool.
    Device {
        /// Target device.
        device_id: String,
        /// Tool on that device.
        tool_id: String,
        /// Tool arguments.
        arguments: serde_json::Value,
    },
    /// Forward to an external agent.
    Delegate {
        /// Target agent endpoint.
        agent_id: String,
    },
    /// Refuse the request; the task is rejected.
    Reject {
        /// Reason surfaced in the terminal status.
        reason: String,
    },
}

/// Lowercase word tokens of a text, for keyword matching.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Configuration for [`IntentRouter`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Minimum keyword overlap K for the fast path.
    pub min_keyword_overlap: usize,

    /// Confidence threshold θ below which non-local LLM decisions
    /// downgrade to a clarification.
    pub confidence_threshold: f64,

    /// LLM call timeout.
    pub llm_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_keyword_overlap: 1,
            confidence_threshold: 0.5,
            llm_timeout: Duration::from_secs(30),
        }
    }
}

/// The intent router.
pub struct IntentRouter {
    llm: Option<Arc<dyn LlmPort>>,
    config: RouterConfig,
}

impl IntentRouter {
    /// Create a router. `llm` may be `None`; routing then relies on the
    /// keyword fast path alone.
    pub fn new(llm: Option<Arc<dyn LlmPort>>, config: RouterConfig) -> Self {
        Self { llm, config }
    }

    /// Decide the path for an input against the given registry snapshot
    /// and endpoint table.
    pub async fn route(
        &self,
        input: &RouteInput,
        devices: &[Device],
        endpoints: &[AgentEndpoint],
    ) -> Decision {
        let tokens = tokenize(&input.text);
        let matched = Self::rank_devices(devices, &tokens, self.config.min_keyword_overlap);

        if let Some(ref llm) = self.llm {
            match self.analyze(llm.as_ref(), input, devices, endpoints).await {
                Ok(analysis) => {
                    return self.apply_analysis(analysis, input, &matched, devices, endpoints)
                }
                Err(e) => {
                    warn!(error = %e, "LLM analysis failed, falling back to keyword routing");
                }
            }
        }

        self.keyword_decision(input, &matched)
    }

    /// Candidate devices ordered per the registry contract: keyword
    /// overlap, then liveness rank, then heartbeat recency. Offline
    /// devices never match.
    fn rank_devices(devices: &[Device], tokens: &[String], min_overlap: usize) -> Vec<Device> {
        let mut matched: Vec<(usize, Device)> = devices
            .iter()
            .filter(|d| d.liveness != Liveness::Offline)
            .filter_map(|d| {
                let overlap = d.keyword_overlap(tokens);
                (overlap >= min_overlap && overlap > 0).then(|| (overlap, d.clone()))
            })
            .collect();
        matched.sort_by(|(oa, a), (ob, b)| {
            ob.cmp(oa)
                .then_with(|| b.liveness.rank().cmp(&a.liveness.rank()))
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        matched.into_iter().map(|(_, d)| d).collect()
    }

    /// The LLM-free path: route iff exactly one online device matches.
    fn keyword_decision(&self, input: &RouteInput, matched: &[Device]) -> Decision {
        match matched {
            [only] => {
                let Some(tool) = Self::best_tool(only) else {
                    return Decision::Reject {
                        reason: format!("device '{}' declares no tools", only.device_id),
                    };
                };
                Decision::Device {
                    device_id: only.device_id.clone(),
                    tool_id: tool.tool_id.clone(),
                    arguments: serde_json::json!({ "text": input.text }),
                }
            }
            [] => match input.origin {
                // Nothing to route to: answer the user directly; for stream
                // observations a local decision means "nothing to do".
                RouteOrigin::Request => Decision::Local {
                    reply: format!("Acknowledged: {}", input.text),
                },
                RouteOrigin::DeviceStream { .. } => Decision::Local {
                    reply: String::new(),
                },
            },
            _ => match input.origin {
                RouteOrigin::Request => Decision::Clarify {
                    question: format!(
                        "Multiple devices can handle this ({}). Which one should be used?",
                        matched
                            .iter()
                            .map(|d| d.device_id.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                },
                RouteOrigin::DeviceStream { .. } => Decision::Local {
                    reply: String::new(),
                },
            },
        }
    }

    /// The tool whose declared input schema is easiest to satisfy:
    /// fewest required properties, then declaration order.
    fn best_tool(device: &Device) -> Option<&ToolDescriptor> {
        device
            .tools
            .iter()
            .enumerate()
            .min_by_key(|(idx, tool)| (tool.required_inputs().len(), *idx))
            .map(|(_, tool)| tool)
    }

    async fn analyze(
        &self,
        llm: &dyn LlmPort,
        input: &RouteInput,
        devices: &[Device],
        endpoints: &[AgentEndpoint],
    ) -> crate::error::BrokerResult<RouteAnalysis> {
        let context = AnalysisContext {
            device_skills: devices
                .iter()
                .filter(|d| d.liveness != Liveness::Offline)
                .map(|d| {
                    let tools: Vec<String> = d
                        .tools
                        .iter()
                        .map(|t| {
                            format!(
                                "{}(required: {})",
                                t.tool_id,
                                t.required_inputs().join(", ")
                            )
                        })
                        .collect();
                    format!(
                        "{} [{}] keywords: {}; tools: {}",
                        d.device_id,
                        d.kind,
                        d.intent_keywords.join(", "),
                        tools.join("; ")
                    )
                })
                .collect(),
            agents: endpoints
                .iter()
                .filter(|e| e.enabled)
                .map(|e| format!("{} tags: {}", e.agent_id, e.capability_tags.join(", ")))
                .collect(),
            system_prompt: match &input.origin {
                RouteOrigin::DeviceStream { system_prompt, .. } => system_prompt.clone(),
                RouteOrigin::Request => None,
            },
        };

        tokio::time::timeout(self.config.llm_timeout, llm.analyze(&input.text, &context))
            .await
            .map_err(|_| crate::error::BrokerError::Timeout("LLM analysis".to_string()))?
    }

    fn apply_analysis(
        &self,
        analysis: RouteAnalysis,
        input: &RouteInput,
        matched: &[Device],
        devices: &[Device],
        endpoints: &[AgentEndpoint],
    ) -> Decision {
        debug!(
            action = ?analysis.action,
            confidence = analysis.confidence,
            rationale = %analysis.rationale,
            "Applying route analysis"
        );

        // Low confidence on anything non-local downgrades to a
        // clarification request.
        if analysis.confidence < self.config.confidence_threshold
            && analysis.action != RouteAction::Local
        {
            return Decision::Clarify {
                question: format!(
                    "I'm not sure how to handle this. Could you clarify what you need? ({})",
                    input.text
                ),
            };
        }

        match analysis.action {
            RouteAction::Local => Decision::Local {
                reply: analysis
                    .arguments
                    .as_ref()
                    .and_then(|a| a.get("reply"))
                    .and_then(|r| r.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| {
                        if analysis.rationale.is_empty() {
                            format!("Acknowledged: {}", input.text)
                        } else {
                            analysis.rationale.clone()
                        }
                    }),
            },
            RouteAction::Device => self.device_decision(analysis, input, matched, devices),
            RouteAction::Delegate => {
                Self::delegate_decision(analysis, &tokenize(&input.text), endpoints)
            }
            RouteAction::Reject => Decision::Reject {
                reason: if analysis.rationale.is_empty() {
                    "request rejected".to_string()
                } else {
                    analysis.rationale
                },
            },
        }
    }

    fn device_decision(
        &self,
        analysis: RouteAnalysis,
        input: &RouteInput,
        matched: &[Device],
        devices: &[Device],
    ) -> Decision {
        // Prefer the analysis target when it names a live device; fall back
        // to the top keyword match otherwise.
        let target = analysis
            .target
            .as_deref()
            .and_then(|id| devices.iter().find(|d| d.device_id == id))
            .filter(|d| d.liveness != Liveness::Offline)
            .or_else(|| {
                matched
                    .first()
                    .and_then(|m| devices.iter().find(|d| d.device_id == m.device_id))
            });

        let Some(device) = target else {
            return Decision::Clarify {
                question: format!("No available device can handle this: {}", input.text),
            };
        };

        let tool = analysis
            .tool
            .as_deref()
            .and_then(|id| device.tool(id))
            .or_else(|| Self::best_tool(device));

        let Some(tool) = tool else {
            return Decision::Reject {
                reason: format!("device '{}' declares no tools", device.device_id),
            };
        };

        Decision::Device {
            device_id: device.device_id.clone(),
            tool_id: tool.tool_id.clone(),
            arguments: analysis
                .arguments
                .unwrap_or_else(|| serde_json::json!({ "text": input.text })),
        }
    }

    /// Pick a delegation target. Tie-break: matching capability-tag count,
    /// then tag-set specificity (fewer declared tags), then most recent
    /// last-success.
    fn delegate_decision(
        analysis: RouteAnalysis,
        tokens: &[String],
        endpoints: &[AgentEndpoint],
    ) -> Decision {
        if let Some(target) = analysis.target.as_deref() {
            if let Some(endpoint) = endpoints.iter().find(|e| e.agent_id == target && e.enabled) {
                return Decision::Delegate {
                    agent_id: endpoint.agent_id.clone(),
                };
            }
        }

        let mut candidates: Vec<&AgentEndpoint> =
            endpoints.iter().filter(|e| e.enabled).collect();
        candidates.sort_by(|a, b| {
            b.tag_overlap(tokens)
                .cmp(&a.tag_overlap(tokens))
                .then_with(|| a.capability_tags.len().cmp(&b.capability_tags.len()))
                .then_with(|| b.last_success.cmp(&a.last_success))
        });

        match candidates.first() {
            Some(endpoint) => Decision::Delegate {
                agent_id: endpoint.agent_id.clone(),
            },
            None => Decision::Reject {
                reason: "no external agent is available for delegation".to_string(),
            },
        }
    }
}
