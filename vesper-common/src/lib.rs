//! Shared data model for the Vesper vehicle edge agent.
//!
//! These types cross the boundary between signal producers (bus adapters,
//! the named-signal front-end, fetch functions, the demo generator) and the
//! inspection daemon. Producers hand typed samples to the daemon through
//! bounded queues; the daemon hands assembled payloads to the sender side.
//! Everything here is plain data with serde derives so scheme files and
//! persisted metadata can round-trip through JSON.

use serde::{Deserialize, Serialize};

// =============================================================================
// SIGNAL IDENTITY
// =============================================================================

/// Signal identifier, globally unique within a decoder manifest.
pub type SignalId = u32;

/// Reserved id that no decoded signal may carry.
pub const INVALID_SIGNAL_ID: SignalId = SignalId::MAX;

/// Identifies the fetch request a sample was collected for.
///
/// Samples pushed by regular bus adapters use [`DEFAULT_FETCH_REQUEST_ID`];
/// samples produced while servicing a fetch carry the id of that fetch so the
/// engine can keep them in fetch-scoped history buffers.
pub type FetchRequestId = u32;

pub const DEFAULT_FETCH_REQUEST_ID: FetchRequestId = 0;

/// Cloud-assigned identifier of a collection scheme or state template.
pub type SyncId = String;

/// Unique identifier of one triggered event.
pub type EventId = u32;

/// Handle referring to opaque bytes held by the raw data buffer manager.
///
/// A newtype rather than a bare integer so a handle can never be mistaken for
/// a numeric sample value anywhere in the engine.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RawHandle(pub u32);

/// Handle value returned when the raw buffer manager rejects a push.
pub const INVALID_RAW_HANDLE: RawHandle = RawHandle(0);

impl RawHandle {
    pub fn is_valid(self) -> bool {
        self != INVALID_RAW_HANDLE
    }
}

/// Data type of a decoded signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
    Bool,
    /// Variable-size values are not inlined; samples carry a [`RawHandle`].
    String,
}

impl SignalType {
    /// Bytes needed to hold one buffered sample of this type, including the
    /// per-sample bookkeeping (timestamp and consumed bitmap).
    pub fn sample_size_bytes(self) -> usize {
        let value = match self {
            SignalType::Uint8 | SignalType::Int8 | SignalType::Bool => 1,
            SignalType::Uint16 | SignalType::Int16 => 2,
            SignalType::Uint32 | SignalType::Int32 | SignalType::Float32 | SignalType::String => 4,
            SignalType::Uint64 | SignalType::Int64 | SignalType::Float64 => 8,
        };
        // timestamp (8) + consumed bitmap (16)
        value + 8 + 16
    }
}

/// A typed signal value as delivered by a producer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalValue {
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Uint64(u64),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    /// Handle into the raw data buffer manager for string/frame payloads.
    RawHandle(RawHandle),
}

impl SignalValue {
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalValue::Uint8(_) => SignalType::Uint8,
            SignalValue::Int8(_) => SignalType::Int8,
            SignalValue::Uint16(_) => SignalType::Uint16,
            SignalValue::Int16(_) => SignalType::Int16,
            SignalValue::Uint32(_) => SignalType::Uint32,
            SignalValue::Int32(_) => SignalType::Int32,
            SignalValue::Uint64(_) => SignalType::Uint64,
            SignalValue::Int64(_) => SignalType::Int64,
            SignalValue::Float32(_) => SignalType::Float32,
            SignalValue::Float64(_) => SignalType::Float64,
            SignalValue::Bool(_) => SignalType::Bool,
            SignalValue::RawHandle(_) => SignalType::String,
        }
    }

    /// Numeric view of the value. Raw handles have no numeric meaning.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            SignalValue::Uint8(v) => Some(f64::from(v)),
            SignalValue::Int8(v) => Some(f64::from(v)),
            SignalValue::Uint16(v) => Some(f64::from(v)),
            SignalValue::Int16(v) => Some(f64::from(v)),
            SignalValue::Uint32(v) => Some(f64::from(v)),
            SignalValue::Int32(v) => Some(f64::from(v)),
            SignalValue::Uint64(v) => Some(v as f64),
            SignalValue::Int64(v) => Some(v as f64),
            SignalValue::Float32(v) => Some(f64::from(v)),
            SignalValue::Float64(v) => Some(v),
            SignalValue::Bool(v) => Some(if v { 1.0 } else { 0.0 }),
            SignalValue::RawHandle(_) => None,
        }
    }
}

// =============================================================================
// TIME
// =============================================================================

/// A point in time captured on both clocks the agent cares about.
///
/// `system_time_ms` is wall-clock milliseconds since the UNIX epoch and ends
/// up in payloads; `monotonic_time_ms` drives subsampling, windows and
/// scheduling and is immune to wall-clock steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePoint {
    pub system_time_ms: u64,
    pub monotonic_time_ms: u64,
}

impl TimePoint {
    pub fn new(system_time_ms: u64, monotonic_time_ms: u64) -> Self {
        Self {
            system_time_ms,
            monotonic_time_ms,
        }
    }
}

// =============================================================================
// INGRESS: SAMPLES AND FRAMES
// =============================================================================

/// One decoded sample on its way into the inspection engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedSignal {
    pub signal_id: SignalId,
    /// Wall-clock receive time in milliseconds since the UNIX epoch.
    pub receive_time_ms: u64,
    pub value: SignalValue,
    #[serde(default)]
    pub fetch_request_id: FetchRequestId,
}

impl CollectedSignal {
    pub fn new(signal_id: SignalId, receive_time_ms: u64, value: SignalValue) -> Self {
        Self {
            signal_id,
            receive_time_ms,
            value,
            fetch_request_id: DEFAULT_FETCH_REQUEST_ID,
        }
    }

    pub fn with_fetch_request(mut self, fetch_request_id: FetchRequestId) -> Self {
        self.fetch_request_id = fetch_request_id;
        self
    }
}

/// A batch of samples pushed onto a signal queue as one element.
///
/// Bus adapters that decode several signals out of one frame push them
/// together so the inspection worker sees them in one drain step. A frame may
/// also carry a fresh DTC snapshot from the diagnostics session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalDataFrame {
    pub signals: Vec<CollectedSignal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_dtcs: Option<DtcInfo>,
}

impl SignalDataFrame {
    pub fn single(signal: CollectedSignal) -> Self {
        Self {
            signals: vec![signal],
            active_dtcs: None,
        }
    }
}

/// Snapshot of the diagnostic trouble codes currently active on the vehicle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcInfo {
    pub receive_time_ms: u64,
    pub active_codes: Vec<String>,
}

impl DtcInfo {
    pub fn has_codes(&self) -> bool {
        !self.active_codes.is_empty()
    }
}

// =============================================================================
// EGRESS: PAYLOADS
// =============================================================================

/// One signal sample inside an assembled payload.
///
/// String samples still carry the raw handle; resolving handles to bytes is
/// the sender's job, so the engine never copies variable-size data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadSignal {
    pub signal_id: SignalId,
    pub timestamp_ms: u64,
    pub value: SignalValue,
    pub signal_type: SignalType,
}

/// Data collected for one triggered collection scheme condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggeredPayload {
    pub scheme_id: SyncId,
    pub event_id: EventId,
    pub trigger_time_ms: u64,
    pub signals: Vec<PayloadSignal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_dtcs: Option<DtcInfo>,
}

/// Signals captured for one state template in a last-known-state update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSignals {
    pub template_id: SyncId,
    pub signals: Vec<PayloadSignal>,
}

/// One last-known-state update covering every template with pending data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastKnownStatePayload {
    pub trigger_time_ms: u64,
    pub templates: Vec<TemplateSignals>,
}

/// Response to an inbound state-template command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: String,
    pub status: CommandStatus,
    pub reason_code: u32,
    pub reason_description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    ExecutionFailed,
}

pub const REASON_CODE_UNSPECIFIED: u32 = 0;
pub const REASON_CODE_STATE_TEMPLATE_OUT_OF_SYNC: u32 = 1;
pub const REASON_CODE_NOT_SUPPORTED: u32 = 2;
pub const REASON_CODE_STATE_TEMPLATE_ALREADY_ACTIVATED: u32 = 3;
pub const REASON_CODE_STATE_TEMPLATE_ALREADY_DEACTIVATED: u32 = 4;

pub const REASON_DESCRIPTION_STATE_TEMPLATE_ALREADY_ACTIVATED: &str =
    "State template is already activated";
pub const REASON_DESCRIPTION_STATE_TEMPLATE_ALREADY_DEACTIVATED: &str =
    "State template is already deactivated";

/// Everything the core can hand to the sender side, typed so the sender can
/// route each item to the serializer that knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SenderData {
    Telemetry(TriggeredPayload),
    LastKnownState(LastKnownStatePayload),
    CommandResponse(CommandResponse),
}

impl SenderData {
    pub fn data_type(&self) -> SenderDataType {
        match self {
            SenderData::Telemetry(_) => SenderDataType::Telemetry,
            SenderData::LastKnownState(_) => SenderDataType::LastKnownState,
            SenderData::CommandResponse(_) => SenderDataType::CommandResponse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderDataType {
    Telemetry,
    LastKnownState,
    CommandResponse,
}

impl SenderDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            SenderDataType::Telemetry => "Telemetry",
            SenderDataType::LastKnownState => "LastKnownState",
            SenderDataType::CommandResponse => "CommandResponse",
        }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Inbound command addressing one state template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTemplateCommand {
    pub command_id: String,
    pub template_id: SyncId,
    pub operation: StateTemplateOperation,
    /// Seconds after which an activation expires on its own; 0 = never.
    #[serde(default)]
    pub deactivate_after_seconds: u32,
    #[serde(default)]
    pub received_time: TimePoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateTemplateOperation {
    Activate,
    Deactivate,
    FetchSnapshot,
}
