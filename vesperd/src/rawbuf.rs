//! Raw data buffer manager.
//!
//! Pools variable-size payloads (string signal values, opaque frames) so the
//! rest of the engine can move them through history buffers, the evaluator
//! and the sender by 32-bit handle without copies. Each signal gets its own
//! partition with its own quota; partitions are independently locked via the
//! sharded map, so producers on different signals never contend.
//!
//! Entries are reference-counted per lifecycle stage. Bytes become
//! reclaimable only when the sum over all stages reaches zero, and
//! reclamation is lazy: a zero-count entry survives until its partition needs
//! room for a new push, oldest first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use log::debug;

use vesper_common::{RawHandle, SignalId, INVALID_RAW_HANDLE};

use crate::config::RawBufConfig;

/// Lifecycle stage a handle use-count is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageStage {
    /// Handle sits in a signal history buffer slot.
    HistoryBuffer,
    /// Handle was assembled into a payload awaiting the sender.
    SelectedForUpload,
    /// Handle is being serialized/transmitted by the sender.
    Uploading,
    /// Handle was produced but has not reached a history buffer yet.
    CollectedNotInHistory,
}

const STAGE_COUNT: usize = 4;

impl UsageStage {
    fn index(self) -> usize {
        match self {
            UsageStage::HistoryBuffer => 0,
            UsageStage::SelectedForUpload => 1,
            UsageStage::Uploading => 2,
            UsageStage::CollectedNotInHistory => 3,
        }
    }
}

/// Per-signal quota limits.
#[derive(Debug, Clone)]
pub struct RawBufPolicy {
    pub max_bytes_per_sample: usize,
    pub max_samples_per_signal: usize,
    pub max_bytes_per_signal: usize,
}

impl From<&RawBufConfig> for RawBufPolicy {
    fn from(config: &RawBufConfig) -> Self {
        Self {
            max_bytes_per_sample: config.max_bytes_per_sample,
            max_samples_per_signal: config.max_samples_per_signal,
            max_bytes_per_signal: config.max_bytes_per_signal,
        }
    }
}

struct Entry {
    handle: RawHandle,
    data: Bytes,
    receive_time_ms: u64,
    usage: [u32; STAGE_COUNT],
}

impl Entry {
    fn total_usage(&self) -> u32 {
        self.usage.iter().sum()
    }
}

struct Partition {
    entries: VecDeque<Entry>,
    next_handle: u32,
    bytes: usize,
    policy: RawBufPolicy,
}

impl Partition {
    fn new(policy: RawBufPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            next_handle: 1,
            bytes: 0,
            policy,
        }
    }

    fn find(&self, handle: RawHandle) -> Option<usize> {
        self.entries.iter().position(|e| e.handle == handle)
    }
}

pub struct RawBufferManager {
    partitions: DashMap<SignalId, Partition>,
    default_policy: RawBufPolicy,
    overrides: DashMap<SignalId, RawBufPolicy>,
    max_total_bytes: usize,
    total_bytes: AtomicUsize,
    rejected: AtomicU64,
}

impl RawBufferManager {
    pub fn new(config: &RawBufConfig) -> Self {
        Self {
            partitions: DashMap::new(),
            default_policy: RawBufPolicy::from(config),
            overrides: DashMap::new(),
            max_total_bytes: config.max_total_bytes,
            total_bytes: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Install a per-signal quota override, replacing the defaults for that
    /// signal's partition from the next push on.
    pub fn set_signal_policy(&self, signal_id: SignalId, policy: RawBufPolicy) {
        if let Some(mut partition) = self.partitions.get_mut(&signal_id) {
            partition.policy = policy.clone();
        }
        self.overrides.insert(signal_id, policy);
    }

    /// Store bytes for a signal and return a handle to them.
    ///
    /// Returns [`INVALID_RAW_HANDLE`] when the sample is over the per-sample
    /// limit or no room can be reclaimed within the quotas.
    pub fn push(&self, signal_id: SignalId, data: Bytes, receive_time_ms: u64) -> RawHandle {
        let policy = self
            .overrides
            .get(&signal_id)
            .map(|p| p.clone())
            .unwrap_or_else(|| self.default_policy.clone());

        if data.len() > policy.max_bytes_per_sample {
            debug!(
                "raw sample for signal {} is {} bytes, over the {} byte limit",
                signal_id,
                data.len(),
                policy.max_bytes_per_sample
            );
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return INVALID_RAW_HANDLE;
        }

        // Relieve global pressure first, before the target partition is
        // locked, by dropping the oldest zero-count entries anywhere.
        self.reclaim_global(data.len());

        let mut partition = self
            .partitions
            .entry(signal_id)
            .or_insert_with(|| Partition::new(policy));

        // Make room within the per-signal and global quotas by dropping the
        // oldest entries of this partition whose use count is zero.
        while self.over_quota(&partition, data.len()) {
            let Some(idx) = partition
                .entries
                .iter()
                .position(|e| e.total_usage() == 0)
            else {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return INVALID_RAW_HANDLE;
            };
            let removed = partition.entries.remove(idx).unwrap();
            partition.bytes -= removed.data.len();
            self.total_bytes.fetch_sub(removed.data.len(), Ordering::Relaxed);
        }

        let handle = RawHandle(partition.next_handle);
        partition.next_handle = partition.next_handle.checked_add(1).unwrap_or(1);
        partition.bytes += data.len();
        self.total_bytes.fetch_add(data.len(), Ordering::Relaxed);
        partition.entries.push_back(Entry {
            handle,
            data,
            receive_time_ms,
            usage: [0; STAGE_COUNT],
        });
        handle
    }

    /// Drop globally-oldest zero-count entries until `incoming` bytes fit
    /// under the global quota, or nothing reclaimable is left.
    fn reclaim_global(&self, incoming: usize) {
        while self.total_bytes.load(Ordering::Relaxed) + incoming > self.max_total_bytes {
            let mut candidate: Option<(SignalId, RawHandle, u64)> = None;
            for partition in self.partitions.iter() {
                for entry in &partition.entries {
                    if entry.total_usage() == 0
                        && candidate
                            .map(|(_, _, oldest)| entry.receive_time_ms < oldest)
                            .unwrap_or(true)
                    {
                        candidate = Some((*partition.key(), entry.handle, entry.receive_time_ms));
                    }
                }
            }
            let Some((signal_id, handle, _)) = candidate else {
                return;
            };
            if let Some(mut partition) = self.partitions.get_mut(&signal_id) {
                if let Some(idx) = partition.find(handle) {
                    let removed = partition.entries.remove(idx).unwrap();
                    partition.bytes -= removed.data.len();
                    self.total_bytes.fetch_sub(removed.data.len(), Ordering::Relaxed);
                }
            }
        }
    }

    fn over_quota(&self, partition: &Partition, incoming: usize) -> bool {
        partition.entries.len() + 1 > partition.policy.max_samples_per_signal
            || partition.bytes + incoming > partition.policy.max_bytes_per_signal
            || self.total_bytes.load(Ordering::Relaxed) + incoming > self.max_total_bytes
    }

    pub fn increase_usage(&self, signal_id: SignalId, handle: RawHandle, stage: UsageStage) {
        if let Some(mut partition) = self.partitions.get_mut(&signal_id) {
            if let Some(idx) = partition.find(handle) {
                partition.entries[idx].usage[stage.index()] += 1;
                return;
            }
        }
        debug!(
            "increase_usage: no entry for signal {} handle {:?}",
            signal_id, handle
        );
    }

    pub fn decrease_usage(&self, signal_id: SignalId, handle: RawHandle, stage: UsageStage) {
        if let Some(mut partition) = self.partitions.get_mut(&signal_id) {
            if let Some(idx) = partition.find(handle) {
                let counter = &mut partition.entries[idx].usage[stage.index()];
                *counter = counter.saturating_sub(1);
                return;
            }
        }
        debug!(
            "decrease_usage: no entry for signal {} handle {:?}",
            signal_id, handle
        );
    }

    /// Scoped read view of the stored bytes. The returned `Bytes` keeps the
    /// underlying allocation alive even if the entry is reclaimed afterwards.
    pub fn borrow(&self, signal_id: SignalId, handle: RawHandle) -> Option<Bytes> {
        let partition = self.partitions.get(&signal_id)?;
        let idx = partition.find(handle)?;
        Some(partition.entries[idx].data.clone())
    }

    /// Current use count of one handle at one stage. Zero when the entry is
    /// unknown.
    pub fn usage_count(&self, signal_id: SignalId, handle: RawHandle, stage: UsageStage) -> u32 {
        self.partitions
            .get(&signal_id)
            .and_then(|p| p.find(handle).map(|idx| p.entries[idx].usage[stage.index()]))
            .unwrap_or(0)
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
