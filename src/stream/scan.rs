//! Scan loop — periodically sweeps device streams and turns interesting
//! entries into internal send-message submissions.
//!
//! Every tick, each online device's log is read from its persisted
//! high-water mark. Each entry is classified by the intent router; a
//! non-local decision becomes an internal `message/send` carrying the
//! `(device_id, seq)` origin key, which the task manager deduplicates.
//! The watermark advances only after the whole batch was dispatched, so
//! redelivery after a crash is possible and harmless (at-least-once).
//! One bad entry never aborts its batch or its device.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::endpoints::AgentEndpointRegistry;
use crate::device::registry::{DeviceFilter, DeviceRegistry};
use crate::device::{Device, Liveness};
use crate::error::BrokerResult;
use crate::repository::Repository;
use crate::router::{Decision, IntentRouter, RouteInput, RouteOrigin};
use crate::server::request_handler::RequestHandler;
use crate::types::{Message, SendMessageParams, StreamOrigin};

use super::store::{StreamEntry, StreamStore};

/// The periodic device-stream scanner.
pub struct ScanLoop {
    store: Arc<StreamStore>,
    registry: Arc<DeviceRegistry>,
    router: Arc<IntentRouter>,
    endpoints: Arc<AgentEndpointRegistry>,
    handler: Arc<dyn RequestHandler>,
    repository: Arc<dyn Repository>,
    batch_limit: usize,
}

impl ScanLoop {
    /// Wire a scan loop from its collaborators.
    pub fn new(
        store: Arc<StreamStore>,
        registry: Arc<DeviceRegistry>,
        router: Arc<IntentRouter>,
        endpoints: Arc<AgentEndpointRegistry>,
        handler: Arc<dyn RequestHandler>,
        repository: Arc<dyn Repository>,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            registry,
            router,
            endpoints,
            handler,
            repository,
            batch_limit,
        }
    }

    /// One sweep over all online devices. Returns the number of entries
    /// dispatched as internal submissions.
    pub async fn tick(&self) -> BrokerResult<usize> {
        let online = self
            .registry
            .list(&DeviceFilter {
                liveness: Some(Liveness::Online),
                kind: None,
            })
            .await;

        let mut dispatched = 0;
        for device in online {
            dispatched += self.scan_device(&device).await?;
        }
        Ok(dispatched)
    }

    async fn scan_device(&self, device: &Device) -> BrokerResult<usize> {
        let watermark = self
            .repository
            .get_watermark(&device.device_id)
            .await?
            .unwrap_or(0);

        let entries = self
            .store
            .read(&device.device_id, watermark + 1, self.batch_limit)
            .await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut dispatched = 0;
        let last_seq = entries.last().map(|e| e.seq).unwrap_or(watermark);

        for entry in &entries {
            // Entry-level failures are logged and skipped; the batch and
            // the device carry on.
            match self.process_entry(device, entry).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        device_id = %device.device_id,
                        seq = entry.seq,
                        error = %e,
                        "Failed to process stream entry"
                    );
                }
            }
        }

        // Advance only after the whole batch was handled.
        self.repository
            .set_watermark(&device.device_id, last_seq)
            .await?;
        debug!(
            device_id = %device.device_id,
            watermark = last_seq,
            dispatched,
            "Scan batch complete"
        );
        Ok(dispatched)
    }

    /// Route one entry; dispatch non-local decisions as internal sends.
    /// Returns whether a submission happened.
    async fn process_entry(&self, device: &Device, entry: &StreamEntry) -> BrokerResult<bool> {
        let text = self.entry_text(entry).await?;
        if text.is_empty() {
            return Ok(false);
        }

        let input = RouteInput {
            text: text.clone(),
            origin: RouteOrigin::DeviceStream {
                device_id: device.device_id.clone(),
                seq: entry.seq,
                system_prompt: device.system_prompt.clone(),
            },
        };
        let devices = self.registry.snapshot().await;
        let endpoints = self.endpoints.enabled().await;
        let decision = self.router.route(&input, &devices, &endpoints).await;

        if matches!(decision, Decision::Local { .. }) {
            return Ok(false);
        }

        // Hand the observation to the request handler as if it had arrived
        // from a privileged internal principal; the origin key makes the
        // resulting task creation idempotent.
        let mut message = Message::user_text(text);
        StreamOrigin {
            device_id: device.device_id.clone(),
            seq: entry.seq,
        }
        .attach(&mut message);

        self.handler
            .on_message_send(SendMessageParams {
                message,
                configuration: None,
                metadata: None,
            })
            .await?;
        Ok(true)
    }

    /// Textual rendition of an entry: the `text` metadata field when
    /// present, otherwise the payload decoded as UTF-8.
    async fn entry_text(&self, entry: &StreamEntry) -> BrokerResult<String> {
        if let Some(text) = entry.metadata.get("text").and_then(|t| t.as_str()) {
            return Ok(text.to_string());
        }
        let payload = self.store.fetch_payload(entry).await?;
        Ok(payload
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default())
    }

    /// Spawn the periodic loop. Runs until `cancel` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "Scan tick failed");
                        }
                    }
                }
            }
        })
    }
}
