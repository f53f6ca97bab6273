//! Device registry — the authoritative in-memory index of attached devices.
//!
//! Mutations write through to the repository; reads are served from memory.
//! On startup the repository is the source of truth (rehydrated devices come
//! back as `unknown` until their port heartbeats again). Every mutation that
//! can change the public capability surface signals a manifest rebuild.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::repository::Repository;

use super::port::DeviceToolPort;
use super::{Device, DevicePatch, DeviceSpec, Liveness};

/// Read filter for [`DeviceRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    /// Only devices in this liveness state.
    pub liveness: Option<Liveness>,

    /// Only devices with this kind tag.
    pub kind: Option<String>,
}

/// The device index. Single-writer on mutations, snapshot reads.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    ports: RwLock<HashMap<String, Arc<dyn DeviceToolPort>>>,
    repository: Arc<dyn Repository>,
    /// Coalesced manifest invalidation signal; at most one rebuild pending.
    rebuild: Arc<Notify>,
}

impl DeviceRegistry {
    /// Create an empty registry writing through to `repository`.
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            ports: RwLock::new(HashMap::new()),
            repository,
            rebuild: Arc::new(Notify::new()),
        }
    }

    /// Rehydrate the index from the repository.
    ///
    /// Restored devices have no attached port yet, so their liveness drops
    /// to `unknown` until the next heartbeat.
    pub async fn hydrate(&self) -> BrokerResult<()> {
        let stored = self.repository.list_devices().await?;
        let mut devices = self.devices.write().await;
        for mut device in stored {
            if device.liveness == Liveness::Online {
                device.liveness = Liveness::Unknown;
            }
            devices.insert(device.device_id.clone(), device);
        }
        info!(count = devices.len(), "Device registry hydrated");
        drop(devices);
        self.mark_manifest_dirty();
        Ok(())
    }

    /// Signal handle the manifest rebuilder listens on.
    pub fn rebuild_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.rebuild)
    }

    fn mark_manifest_dirty(&self) {
        self.rebuild.notify_one();
    }

    /// Register a device: validate id uniqueness, probe the capability
    /// source to ingest the declared tool list, persist, and index.
    pub async fn register(
        &self,
        spec: DeviceSpec,
        port: Arc<dyn DeviceToolPort>,
    ) -> BrokerResult<Device> {
        {
            let devices = self.devices.read().await;
            if devices.contains_key(&spec.device_id) {
                return Err(BrokerError::invalid_params(format!(
                    "device '{}' is already registered",
                    spec.device_id
                )));
            }
        }

        // Probe the capability source; an unreachable port rejects the
        // registration outright.
        let tools = port.discover_tools().await.map_err(|e| {
            BrokerError::invalid_request(format!(
                "capability source for '{}' is unreachable: {}",
                spec.device_id, e
            ))
        })?;

        {
            let mut seen = std::collections::HashSet::new();
            for tool in &tools {
                if !seen.insert(tool.tool_id.as_str()) {
                    return Err(BrokerError::invalid_request(format!(
                        "device '{}' declares duplicate tool '{}'",
                        spec.device_id, tool.tool_id
                    )));
                }
            }
        }

        let device = Device {
            device_id: spec.device_id.clone(),
            display_name: spec.display_name,
            kind: spec.kind,
            endpoint: spec.endpoint,
            tools,
            intent_keywords: spec.intent_keywords,
            last_seen: Utc::now(),
            liveness: Liveness::Online,
            system_prompt: spec.system_prompt,
        };

        self.repository.save_device(device.clone()).await?;
        self.devices
            .write()
            .await
            .insert(device.device_id.clone(), device.clone());
        self.ports
            .write()
            .await
            .insert(device.device_id.clone(), port);

        info!(device_id = %device.device_id, tools = device.tools.len(), "Device registered");
        self.mark_manifest_dirty();
        Ok(device)
    }

    /// Remove a device. In-flight tool invocations observe the missing
    /// port at their next boundary and fail their task with `DeviceGone`.
    pub async fn deregister(&self, device_id: &str) -> BrokerResult<()> {
        let removed = self.devices.write().await.remove(device_id);
        if removed.is_none() {
            return Err(BrokerError::invalid_params(format!(
                "unknown device '{}'",
                device_id
            )));
        }
        self.ports.write().await.remove(device_id);
        self.repository.delete_device(device_id).await?;
        info!(device_id = %device_id, "Device deregistered");
        self.mark_manifest_dirty();
        Ok(())
    }

    /// Record a heartbeat: refresh last-seen, and flip non-online devices
    /// back to online (which changes the manifest).
    pub async fn heartbeat(&self, device_id: &str) -> BrokerResult<()> {
        let updated = {
            let mut devices = self.devices.write().await;
            let device = devices.get_mut(device_id).ok_or_else(|| {
                BrokerError::invalid_params(format!("unknown device '{}'", device_id))
            })?;
            device.last_seen = Utc::now();
            let was = device.liveness;
            device.liveness = Liveness::Online;
            (device.clone(), was)
        };

        self.repository.save_device(updated.0).await?;
        if updated.1 != Liveness::Online {
            debug!(device_id = %device_id, from = ?updated.1, "Device back online");
            self.mark_manifest_dirty();
        }
        Ok(())
    }

    /// Patch the mutable device fields.
    pub async fn update(&self, device_id: &str, patch: DevicePatch) -> BrokerResult<Device> {
        let device = {
            let mut devices = self.devices.write().await;
            let device = devices.get_mut(device_id).ok_or_else(|| {
                BrokerError::invalid_params(format!("unknown device '{}'", device_id))
            })?;
            if let Some(name) = patch.display_name {
                device.display_name = name;
            }
            if let Some(keywords) = patch.intent_keywords {
                device.intent_keywords = keywords;
            }
            if let Some(prompt) = patch.system_prompt {
                device.system_prompt = (!prompt.is_empty()).then_some(prompt);
            }
            device.clone()
        };

        self.repository.save_device(device.clone()).await?;
        self.mark_manifest_dirty();
        Ok(device)
    }

    /// Re-probe a device's port and replace its declared tool list.
    pub async fn refresh_tools(&self, device_id: &str) -> BrokerResult<Device> {
        let port = self.port(device_id).await.ok_or_else(|| {
            BrokerError::DeviceGone(format!("no port attached for '{}'", device_id))
        })?;
        let tools = port.discover_tools().await?;

        let device = {
            let mut devices = self.devices.write().await;
            let device = devices.get_mut(device_id).ok_or_else(|| {
                BrokerError::invalid_params(format!("unknown device '{}'", device_id))
            })?;
            device.tools = tools;
            device.clone()
        };
        self.repository.save_device(device.clone()).await?;
        self.mark_manifest_dirty();
        Ok(device)
    }

    /// Look up a device by id.
    pub async fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// The port attached to a device, if any.
    pub async fn port(&self, device_id: &str) -> Option<Arc<dyn DeviceToolPort>> {
        self.ports.read().await.get(device_id).cloned()
    }

    /// List devices matching the filter.
    pub async fn list(&self, filter: &DeviceFilter) -> Vec<Device> {
        let mut out: Vec<Device> = self
            .devices
            .read()
            .await
            .values()
            .filter(|d| {
                filter.liveness.map(|l| d.liveness == l).unwrap_or(true)
                    && filter
                        .kind
                        .as_deref()
                        .map(|k| d.kind == k)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    /// Snapshot of every registered device.
    pub async fn snapshot(&self) -> Vec<Device> {
        self.list(&DeviceFilter::default()).await
    }

    /// Candidate devices for an intent, best first.
    ///
    /// Ordering: keyword overlap count, then liveness (online > unknown),
    /// then most recent heartbeat. Offline devices never match.
    pub async fn match_by_intent(&self, tokens: &[String], kind: Option<&str>) -> Vec<Device> {
        let mut candidates: Vec<(usize, Device)> = self
            .devices
            .read()
            .await
            .values()
            .filter(|d| d.liveness != Liveness::Offline)
            .filter(|d| kind.map(|k| d.kind == k).unwrap_or(true))
            .filter_map(|d| {
                let overlap = d.keyword_overlap(tokens);
                (overlap > 0).then(|| (overlap, d.clone()))
            })
            .collect();

        candidates.sort_by(|(oa, a), (ob, b)| {
            ob.cmp(oa)
                .then_with(|| b.liveness.rank().cmp(&a.liveness.rank()))
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        candidates.into_iter().map(|(_, d)| d).collect()
    }

    /// Apply the liveness policy at `now`: no heartbeat for `grace` drops a
    /// device to `unknown`, for `2 * grace` to `offline`.
    ///
    /// Returns the ids whose liveness changed.
    pub async fn apply_liveness_policy(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Vec<String> {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::seconds(90));
        let mut changed = Vec::new();
        let mut to_persist = Vec::new();

        {
            let mut devices = self.devices.write().await;
            for device in devices.values_mut() {
                let silent = now - device.last_seen;
                let next = if silent >= grace * 2 {
                    Liveness::Offline
                } else if silent >= grace {
                    Liveness::Unknown
                } else {
                    Liveness::Online
                };
                // The policy only demotes; promotion happens on heartbeat.
                if next != device.liveness && next.rank() < device.liveness.rank() {
                    warn!(
                        device_id = %device.device_id,
                        from = ?device.liveness,
                        to = ?next,
                        "Device liveness degraded"
                    );
                    device.liveness = next;
                    changed.push(device.device_id.clone());
                    to_persist.push(device.clone());
                }
            }
        }

        for device in to_persist {
            if let Err(e) = self.repository.save_device(device).await {
                warn!(error = %e, "Failed to persist liveness transition");
            }
        }
        if !changed.is_empty() {
            self.mark_manifest_dirty();
        }
        changed
    }

    /// Spawn the background liveness sweeper. Runs until `cancel` fires.
    pub fn spawn_liveness_sweeper(
        self: Arc<Self>,
        interval: Duration,
        grace: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.apply_liveness_policy(Utc::now(), grace).await;
                    }
                }
            }
        })
    }
}
