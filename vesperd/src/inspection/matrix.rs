//! Inspection matrix: the pre-parsed, immutable description of every active
//! collection scheme condition.
//!
//! The matrix is handed to the engine as a shared snapshot; condition rows
//! keep indices into it rather than owning pieces of it, and the previous
//! snapshot is retired only after a new one was fully built and accepted.

use serde::{Deserialize, Serialize};

use vesper_common::{FetchRequestId, SignalId, SignalType, SyncId, DEFAULT_FETCH_REQUEST_ID};

use crate::inspection::expr::ExpressionNode;

/// Hard cap on the sample memory of all history buffers together.
pub const MAX_SAMPLE_MEMORY_BYTES: usize = 20 * 1024 * 1024;

/// Absolute epsilon for equality comparisons on noisy signal values.
pub const EVAL_EQUAL_DISTANCE: f64 = 1e-3;

/// How one signal is buffered for one condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalCollectionInfo {
    pub signal_id: SignalId,
    /// Samples to keep and to publish when the condition triggers.
    pub sample_buffer_size: usize,
    /// Subsampling interval; 0 accepts every sample.
    #[serde(default)]
    pub minimum_sample_interval_ms: u32,
    /// Fixed-window length for window functions over this signal; 0 = none.
    #[serde(default)]
    pub fixed_window_period_ms: u64,
    /// Signal is only evaluated, never included in payloads.
    #[serde(default)]
    pub is_condition_only: bool,
    pub signal_type: SignalType,
    /// Samples for this signal are expected from this fetch request; the
    /// default scope carries regular bus traffic.
    #[serde(default)]
    pub fetch_request_id: FetchRequestId,
}

impl SignalCollectionInfo {
    pub fn is_fetch_scoped(&self) -> bool {
        self.fetch_request_id != DEFAULT_FETCH_REQUEST_ID
    }
}

/// One collection scheme condition with the signals it captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub scheme_id: SyncId,
    pub condition: ExpressionNode,
    #[serde(default)]
    pub signals: Vec<SignalCollectionInfo>,
    /// Trigger only on a false-to-true transition instead of on every true
    /// evaluation.
    #[serde(default)]
    pub trigger_only_on_rising_edge: bool,
    /// Expression references no signals; evaluated once when the matrix is
    /// applied.
    #[serde(default)]
    pub is_static: bool,
    /// Delay between trigger and collection so post-trigger samples are
    /// included.
    #[serde(default)]
    pub after_duration_ms: u32,
    #[serde(default)]
    pub include_active_dtcs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectionMatrix {
    pub conditions: Vec<ConditionSpec>,
}
