//! Runtime tunables for the broker.
//!
//! Everything that has a wall-clock, size, or concurrency default lives
//! here so deployments can override it from a config file. All durations
//! are expressed in seconds on the wire.

use serde::Deserialize;
use std::time::Duration;

/// Tunables for the broker runtime. `Default` carries production defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Payloads at or below this size (bytes) are stored inline in stream
    /// entries; larger payloads go to the external payload store.
    pub inline_payload_threshold: usize,

    /// Stream entries older than this many seconds are evicted.
    pub retention_secs: u64,

    /// How often the retention sweep runs, in seconds.
    pub retention_sweep_interval_secs: u64,

    /// A device with no heartbeat for this many seconds becomes `unknown`;
    /// after twice this, `offline`.
    pub heartbeat_grace_secs: u64,

    /// How often the liveness sweep runs, in seconds.
    pub liveness_sweep_interval_secs: u64,

    /// Scan loop period, in seconds.
    pub scan_interval_secs: u64,

    /// Maximum stream entries processed per device per scan tick.
    pub scan_batch_limit: usize,

    /// Number of pool workers. Defaults to the CPU count, minimum 4.
    pub worker_count: usize,

    /// Bounded depth of the worker job queue.
    pub queue_depth: usize,

    /// How long a submission may wait on a full queue before failing
    /// with `Overloaded`, in seconds.
    pub submit_grace_secs: u64,

    /// Minimum intent-keyword overlap for the router's fast path.
    pub min_keyword_overlap: usize,

    /// Router confidence threshold θ — below it, non-local decisions
    /// downgrade to a clarification request.
    pub confidence_threshold: f64,

    /// Deadline for `blocking=true` sends, in seconds.
    pub blocking_request_timeout_secs: u64,

    /// Per-attempt push delivery timeout, in seconds.
    pub push_attempt_timeout_secs: u64,

    /// Maximum push delivery attempts per event per target.
    pub push_max_attempts: u32,

    /// Base delay of the push retry backoff, in seconds.
    pub push_backoff_base_secs: u64,

    /// Cap of the push retry backoff, in seconds.
    pub push_backoff_cap_secs: u64,

    /// LLM analysis call timeout, in seconds.
    pub llm_timeout_secs: u64,

    /// Default device tool invocation timeout, in seconds. Individual
    /// tools may override it on their descriptor.
    pub tool_timeout_secs: u64,

    /// Maximum outbound delegation attempts per request.
    pub delegate_max_attempts: u32,

    /// Per-request timeout for outbound delegation calls, in seconds.
    pub delegate_timeout_secs: u64,

    /// Whether each state change appends an entry to task history.
    pub state_transition_history: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            inline_payload_threshold: 1024 * 1024,
            retention_secs: 24 * 60 * 60,
            retention_sweep_interval_secs: 60,
            heartbeat_grace_secs: 90,
            liveness_sweep_interval_secs: 15,
            scan_interval_secs: 30,
            scan_batch_limit: 64,
            worker_count: num_cpus::get().max(4),
            queue_depth: 256,
            submit_grace_secs: 2,
            min_keyword_overlap: 1,
            confidence_threshold: 0.5,
            blocking_request_timeout_secs: 60,
            push_attempt_timeout_secs: 15,
            push_max_attempts: 6,
            push_backoff_base_secs: 1,
            push_backoff_cap_secs: 60,
            llm_timeout_secs: 30,
            tool_timeout_secs: 60,
            delegate_max_attempts: 3,
            delegate_timeout_secs: 60,
            state_transition_history: true,
        }
    }
}

impl BrokerConfig {
    /// Retention horizon as a [`Duration`].
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Heartbeat grace period H as a [`Duration`].
    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.heartbeat_grace_secs)
    }

    /// Scan period P as a [`Duration`].
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Submission grace as a [`Duration`].
    pub fn submit_grace(&self) -> Duration {
        Duration::from_secs(self.submit_grace_secs)
    }

    /// Blocking-send deadline as a [`Duration`].
    pub fn blocking_request_timeout(&self) -> Duration {
        Duration::from_secs(self.blocking_request_timeout_secs)
    }

    /// LLM call timeout as a [`Duration`].
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    /// Default tool invocation timeout as a [`Duration`].
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Outbound delegation timeout as a [`Duration`].
    pub fn delegate_timeout(&self) -> Duration {
        Duration::from_secs(self.delegate_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.inline_payload_threshold, 1024 * 1024);
        assert_eq!(cfg.retention_secs, 86_400);
        assert_eq!(cfg.heartbeat_grace_secs, 90);
        assert_eq!(cfg.scan_interval_secs, 30);
        assert!(cfg.worker_count >= 4);
        assert_eq!(cfg.confidence_threshold, 0.5);
        assert_eq!(cfg.push_max_attempts, 6);
        assert_eq!(cfg.delegate_timeout_secs, 60);
        assert!(cfg.state_transition_history);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: BrokerConfig =
            serde_json::from_str(r#"{"scanIntervalSecs": 5, "confidenceThreshold": 0.8}"#).unwrap();
        assert_eq!(cfg.scan_interval_secs, 5);
        assert_eq!(cfg.confidence_threshold, 0.8);
        assert_eq!(cfg.retention_secs, 86_400);
    }
}
