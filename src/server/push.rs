//! Push notification delivery — outbound POSTs of task events to
//! client-supplied callback URLs.
//!
//! Each `(task, config)` target gets its own serial lane so a target always
//! observes events in task order, while different targets proceed
//! independently. Delivery is best-effort: 5xx responses, timeouts, and
//! transport errors are retried with exponential backoff (base 1 s, cap
//! 60 s, at most 6 attempts); 4xx responses are logged and dropped. After
//! the final attempt the event is abandoned — subscribers reconcile via
//! `tasks/get`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{PushAuthentication, PushNotificationConfig, StreamEvent};

/// Header carrying the delivery id for client-side dedup.
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-Id";

/// Retry policy for push deliveries.
#[derive(Debug, Clone)]
pub struct PushRetryConfig {
    /// Maximum attempts per event per target.
    pub max_attempts: u32,

    /// Base backoff delay.
    pub base_delay: Duration,

    /// Backoff cap.
    pub max_delay: Duration,

    /// Per-attempt HTTP timeout.
    pub attempt_timeout: Duration,
}

impl Default for PushRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

impl PushRetryConfig {
    /// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor.min(u32::MAX as u64) as u32)
            .min(self.max_delay)
    }
}

/// One queued delivery.
struct Delivery {
    delivery_id: String,
    config: PushNotificationConfig,
    event: StreamEvent,
}

/// Per-target serialized push delivery queues.
pub struct PushDeliveryQueue {
    client: reqwest::Client,
    retry: PushRetryConfig,
    lanes: Mutex<HashMap<String, mpsc::Sender<Delivery>>>,
    shutdown: CancellationToken,
}

impl PushDeliveryQueue {
    /// Create a delivery queue with the given retry policy.
    pub fn new(retry: PushRetryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(retry.attempt_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            retry,
            lanes: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Enqueue an event for a target. Never blocks the caller for delivery;
    /// a target whose lane is saturated drops the event (it reconciles via
    /// `tasks/get`).
    pub async fn enqueue(
        &self,
        task_id: &str,
        config: PushNotificationConfig,
        event: StreamEvent,
    ) {
        let lane_key = format!(
            "{}:{}",
            task_id,
            config.id.as_deref().unwrap_or(config.url.as_str())
        );

        let delivery = Delivery {
            delivery_id: Uuid::new_v4().to_string(),
            config,
            event,
        };

        let mut lanes = self.lanes.lock().await;
        let tx = lanes.entry(lane_key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(256);
            let client = self.client.clone();
            let retry = self.retry.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(Self::lane_worker(lane_key, client, retry, rx, shutdown));
            tx
        });

        if tx.try_send(delivery).is_err() {
            warn!(task_id = %task_id, "Push lane saturated, dropping event");
        }
    }

    /// Stop all lane workers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serial worker for one target: events leave in queue order.
    async fn lane_worker(
        lane: String,
        client: reqwest::Client,
        retry: PushRetryConfig,
        mut rx: mpsc::Receiver<Delivery>,
        shutdown: CancellationToken,
    ) {
        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(d) => d,
                    None => break,
                },
            };
            Self::deliver_with_retries(&lane, &client, &retry, &delivery, &shutdown).await;
        }
    }

    async fn deliver_with_retries(
        lane: &str,
        client: &reqwest::Client,
        retry: &PushRetryConfig,
        delivery: &Delivery,
        shutdown: &CancellationToken,
    ) {
        for attempt in 1..=retry.max_attempts {
            match Self::attempt(client, delivery).await {
                AttemptOutcome::Delivered => {
                    debug!(lane = %lane, delivery_id = %delivery.delivery_id, attempt, "Push delivered");
                    return;
                }
                AttemptOutcome::ClientError(status) => {
                    // 4xx is the subscriber telling us the request itself is
                    // wrong; retrying cannot help.
                    warn!(
                        lane = %lane,
                        delivery_id = %delivery.delivery_id,
                        status,
                        "Push rejected by subscriber, dropping"
                    );
                    return;
                }
                AttemptOutcome::Retryable(reason) => {
                    if attempt == retry.max_attempts {
                        warn!(
                            lane = %lane,
                            delivery_id = %delivery.delivery_id,
                            reason = %reason,
                            "Push abandoned after final attempt"
                        );
                        return;
                    }
                    let delay = retry.delay(attempt);
                    debug!(
                        lane = %lane,
                        delivery_id = %delivery.delivery_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Push attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(client: &reqwest::Client, delivery: &Delivery) -> AttemptOutcome {
        let mut request = client
            .post(&delivery.config.url)
            .header(DELIVERY_ID_HEADER, &delivery.delivery_id)
            .json(&delivery.event);

        match &delivery.config.authentication {
            Some(PushAuthentication::Bearer { token }) => {
                request = request.bearer_auth(token);
            }
            Some(PushAuthentication::Headers { headers }) => {
                for (key, value) in headers {
                    request = request.header(key, value);
                }
            }
            None => {}
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    AttemptOutcome::Delivered
                } else if status.is_client_error() {
                    AttemptOutcome::ClientError(status.as_u16())
                } else {
                    AttemptOutcome::Retryable(format!("HTTP {}", status))
                }
            }
            Err(e) if e.is_timeout() => AttemptOutcome::Retryable("timeout".to_string()),
            Err(e) => AttemptOutcome::Retryable(e.to_string()),
        }
    }
}

enum AttemptOutcome {
    Delivered,
    ClientError(u16),
    Retryable(String),
}
