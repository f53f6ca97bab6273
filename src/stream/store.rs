//! Stream store — per-device append-only logs with hybrid payload storage.
//!
//! Payloads at or below the inline threshold live inside the entry record;
//! larger payloads go to a [`PayloadStore`] keyed by `(device_id, seq)` and
//! the entry keeps the locator. The payload is written before the entry is
//! committed, so a crash can orphan a payload but never leave an entry
//! pointing at nothing it once had — a locator that later fails to resolve
//! surfaces as [`PayloadRef::Unavailable`], not a hard error.
//!
//! Retention: a background sweep evicts entries older than the horizon,
//! removing the external payload before the entry record. Readers observe
//! eviction as a monotonically advancing `min_seq`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};

/// Where an entry's payload lives.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadRef {
    /// Payload stored inline with the entry.
    Inline(Vec<u8>),
    /// Payload stored externally; the locator resolves via the payload store.
    External {
        /// Opaque locator understood by the payload store.
        locator: String,
    },
    /// The entry is committed but its external payload no longer resolves.
    Unavailable,
}

/// One durable record appended by a device.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// The device that produced the entry.
    pub device_id: String,

    /// Strictly increasing per device, starting at 1.
    pub seq: u64,

    /// Append time.
    pub timestamp: DateTime<Utc>,

    /// Device-supplied metadata (e.g. content type, sensor channel).
    pub metadata: serde_json::Value,

    /// The payload reference.
    pub payload: PayloadRef,
}

/// External payload storage keyed by opaque locators.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Store a payload for `(device_id, seq)` and return its locator.
    async fn put(&self, device_id: &str, seq: u64, bytes: &[u8]) -> BrokerResult<String>;

    /// Resolve a locator. `None` when the payload is missing.
    async fn get(&self, locator: &str) -> BrokerResult<Option<Vec<u8>>>;

    /// Remove a payload. Succeeds silently when absent.
    async fn remove(&self, locator: &str) -> BrokerResult<()>;

    /// Remove payloads orphaned before `cutoff` — written but never
    /// committed to an entry (a crash between the external write and the
    /// entry commit). Backends where orphans cannot occur need not
    /// override this.
    async fn prune_orphans(&self, cutoff: std::time::SystemTime) -> BrokerResult<()> {
        let _ = cutoff;
        Ok(())
    }
}

/// In-memory payload store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryPayloadStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryPayloadStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn put(&self, device_id: &str, seq: u64, bytes: &[u8]) -> BrokerResult<String> {
        let locator = format!("{}/{}", device_id, seq);
        self.blobs
            .write()
            .await
            .insert(locator.clone(), bytes.to_vec());
        Ok(locator)
    }

    async fn get(&self, locator: &str) -> BrokerResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(locator).cloned())
    }

    async fn remove(&self, locator: &str) -> BrokerResult<()> {
        self.blobs.write().await.remove(locator);
        Ok(())
    }
}

/// File-backed payload store: one file per payload under
/// `{root}/{device_id}/{seq}.bin`.
#[derive(Debug, Clone)]
pub struct FilePayloadStore {
    root: PathBuf,
}

impl FilePayloadStore {
    /// Create a store rooted at `root` (created on first write).
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Remove payload files whose modification time predates `cutoff`.
    ///
    /// Catches payloads orphaned by a crash between the external write and
    /// the entry commit; regular eviction removes payloads by locator.
    pub async fn prune_older_than(&self, cutoff: std::time::SystemTime) -> BrokerResult<()> {
        let mut devices = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(BrokerError::internal_error(format!(
                    "failed to read payload root: {}",
                    e
                )))
            }
        };

        while let Ok(Some(device_dir)) = devices.next_entry().await {
            let Ok(mut files) = fs::read_dir(device_dir.path()).await else {
                continue;
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let Ok(meta) = file.metadata().await else {
                    continue;
                };
                if meta.modified().map(|m| m < cutoff).unwrap_or(false) {
                    if let Err(e) = fs::remove_file(file.path()).await {
                        warn!(path = ?file.path(), error = %e, "Failed to prune payload file");
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PayloadStore for FilePayloadStore {
    async fn put(&self, device_id: &str, seq: u64, bytes: &[u8]) -> BrokerResult<String> {
        let dir = self.root.join(device_id);
        fs::create_dir_all(&dir).await.map_err(|e| {
            BrokerError::internal_error(format!("failed to create payload directory: {}", e))
        })?;
        let locator = format!("{}/{}.bin", device_id, seq);
        fs::write(self.root.join(&locator), bytes)
            .await
            .map_err(|e| {
                BrokerError::internal_error(format!("failed to write payload file: {}", e))
            })?;
        Ok(locator)
    }

    async fn get(&self, locator: &str) -> BrokerResult<Option<Vec<u8>>> {
        match fs::read(self.root.join(locator)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BrokerError::internal_error(format!(
                "failed to read payload file: {}",
                e
            ))),
        }
    }

    async fn remove(&self, locator: &str) -> BrokerResult<()> {
        match fs::remove_file(self.root.join(locator)).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BrokerError::internal_error(format!(
                "failed to remove payload file: {}",
                e
            ))),
        }
    }

    async fn prune_orphans(&self, cutoff: std::time::SystemTime) -> BrokerResult<()> {
        self.prune_older_than(cutoff).await
    }
}

/// Per-device log state.
struct DeviceLog {
    entries: VecDeque<StreamEntry>,
    next_seq: u64,
    min_seq: u64,
    tails: Vec<mpsc::Sender<StreamEntry>>,
}

impl DeviceLog {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 1,
            min_seq: 1,
            tails: Vec::new(),
        }
    }
}

/// The per-device append-only log store.
pub struct StreamStore {
    logs: RwLock<HashMap<String, DeviceLog>>,
    payloads: Arc<dyn PayloadStore>,
    inline_threshold: usize,
    retention: chrono::Duration,
}

impl StreamStore {
    /// Create a store with the given payload backend, inline threshold
    /// (bytes), and retention horizon.
    pub fn new(
        payloads: Arc<dyn PayloadStore>,
        inline_threshold: usize,
        retention: Duration,
    ) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            payloads,
            inline_threshold,
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    /// Append a payload for a device. Returns the assigned sequence number.
    pub async fn append(
        &self,
        device_id: &str,
        metadata: serde_json::Value,
        payload: Vec<u8>,
    ) -> BrokerResult<u64> {
        // Reserve the sequence number first so the external payload can be
        // keyed by it. A failed external write leaves a gap in the log,
        // never a dangling entry.
        let seq = {
            let mut logs = self.logs.write().await;
            let log = logs
                .entry(device_id.to_string())
                .or_insert_with(DeviceLog::new);
            let seq = log.next_seq;
            log.next_seq += 1;
            seq
        };

        let payload_ref = if payload.len() <= self.inline_threshold {
            PayloadRef::Inline(payload)
        } else {
            let locator = self.payloads.put(device_id, seq, &payload).await?;
            PayloadRef::External { locator }
        };

        let entry = StreamEntry {
            device_id: device_id.to_string(),
            seq,
            timestamp: Utc::now(),
            metadata,
            payload: payload_ref,
        };

        let mut logs = self.logs.write().await;
        let log = logs
            .entry(device_id.to_string())
            .or_insert_with(DeviceLog::new);
        // Reservation and commit are separate steps, so two in-flight
        // appends can commit out of order; keep the log seq-sorted.
        let pos = log
            .entries
            .iter()
            .rposition(|e| e.seq < entry.seq)
            .map(|p| p + 1)
            .unwrap_or(0);
        if pos == log.entries.len() {
            log.entries.push_back(entry.clone());
        } else {
            log.entries.insert(pos, entry.clone());
        }

        // Fan out to live tails. A tail that is closed or can't keep up is
        // dropped; a lagging subscriber must re-read from its last seq
        // rather than observe a gap.
        log.tails.retain(|tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(device_id = %entry.device_id, "Dropping lagging tail subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        debug!(device_id = %device_id, seq, "Stream entry appended");
        Ok(seq)
    }

    /// Read up to `limit` entries with `seq >= from_seq`, ascending.
    ///
    /// External payloads are existence-checked; a missing one downgrades
    /// the entry's payload to [`PayloadRef::Unavailable`].
    pub async fn read(
        &self,
        device_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let selected: Vec<StreamEntry> = {
            let logs = self.logs.read().await;
            match logs.get(device_id) {
                Some(log) => log
                    .entries
                    .iter()
                    .filter(|e| e.seq >= from_seq)
                    .take(limit)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut out = Vec::with_capacity(selected.len());
        for mut entry in selected {
            if let PayloadRef::External { ref locator } = entry.payload {
                if self.payloads.get(locator).await?.is_none() {
                    warn!(
                        device_id = %entry.device_id,
                        seq = entry.seq,
                        locator = %locator,
                        "External payload missing"
                    );
                    entry.payload = PayloadRef::Unavailable;
                }
            }
            out.push(entry);
        }
        Ok(out)
    }

    /// Resolve an entry's payload bytes. `None` for unavailable payloads.
    pub async fn fetch_payload(&self, entry: &StreamEntry) -> BrokerResult<Option<Vec<u8>>> {
        match &entry.payload {
            PayloadRef::Inline(bytes) => Ok(Some(bytes.clone())),
            PayloadRef::External { locator } => self.payloads.get(locator).await,
            PayloadRef::Unavailable => Ok(None),
        }
    }

    /// Open a tail subscription delivering all subsequent entries in order.
    /// Dropping the receiver closes the subscription.
    pub async fn tail(&self, device_id: &str) -> mpsc::Receiver<StreamEntry> {
        let (tx, rx) = mpsc::channel(64);
        let mut logs = self.logs.write().await;
        logs.entry(device_id.to_string())
            .or_insert_with(DeviceLog::new)
            .tails
            .push(tx);
        rx
    }

    /// Smallest readable sequence number for a device (advances on eviction).
    pub async fn min_seq(&self, device_id: &str) -> u64 {
        self.logs
            .read()
            .await
            .get(device_id)
            .map(|l| l.min_seq)
            .unwrap_or(1)
    }

    /// Latest assigned sequence number for a device (0 when empty).
    pub async fn latest_seq(&self, device_id: &str) -> u64 {
        self.logs
            .read()
            .await
            .get(device_id)
            .map(|l| l.next_seq - 1)
            .unwrap_or(0)
    }

    /// Evict entries older than the retention horizon at `now`.
    ///
    /// External payloads are removed before their entry records, so no
    /// surviving entry ever references a payload this sweep deleted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> BrokerResult<usize> {
        let cutoff = now - self.retention;
        let device_ids: Vec<String> = self.logs.read().await.keys().cloned().collect();
        let mut evicted = 0;

        for device_id in device_ids {
            loop {
                // Inspect the head without removing it; appends only touch
                // the tail and this sweep is the only evictor.
                let head = {
                    let logs = self.logs.read().await;
                    match logs.get(&device_id).and_then(|l| l.entries.front()) {
                        Some(entry) if entry.timestamp < cutoff => Some(entry.clone()),
                        _ => None,
                    }
                };
                let Some(entry) = head else { break };

                if let PayloadRef::External { ref locator } = entry.payload {
                    self.payloads.remove(locator).await?;
                }

                let mut logs = self.logs.write().await;
                if let Some(log) = logs.get_mut(&device_id) {
                    if log
                        .entries
                        .front()
                        .map(|e| e.seq == entry.seq)
                        .unwrap_or(false)
                    {
                        log.entries.pop_front();
                        log.min_seq = entry.seq + 1;
                        evicted += 1;
                    }
                }
            }
        }

        // Anything in the payload store older than the horizon that the
        // eviction above did not remove is an orphan from a partial write.
        if let Ok(age) = self.retention.to_std() {
            if let Some(cutoff) = std::time::SystemTime::now().checked_sub(age) {
                self.payloads.prune_orphans(cutoff).await?;
            }
        }

        if evicted > 0 {
            debug!(evicted, "Stream retention sweep evicted entries");
        }
        Ok(evicted)
    }

    /// Spawn the background retention sweeper. Runs until `cancel` fires.
    pub fn spawn_retention_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep(Utc::now()).await {
                            warn!(error = %e, "Stream retention sweep failed");
                        }
                    }
                }
            }
        })
    }
}
