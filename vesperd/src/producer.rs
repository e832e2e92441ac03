//! Signal producer front-end.
//!
//! [`SignalDistributor`] is the single entry point producers push decoded
//! samples through; it fans each frame out to every interested worker queue
//! (collection engine, last-known-state inspector). [`NamedSignalSource`]
//! sits on top for sources that identify signals by fully-qualified name
//! instead of decoder id, with a swappable name dictionary; its string
//! values round-trip through the raw buffer manager so only a handle enters
//! the queues.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use log::{debug, warn};

use vesper_common::{
    CollectedSignal, FetchRequestId, SignalDataFrame, SignalId, SignalType, SignalValue,
};

use crate::clock::Clock;
use crate::metrics::Metrics;
use crate::queue::{BoundedQueue, QueueDistributor};
use crate::rawbuf::{RawBufferManager, UsageStage};

pub struct SignalDistributor {
    queues: QueueDistributor<SignalDataFrame>,
    metrics: Arc<Metrics>,
}

impl SignalDistributor {
    /// Build the distributor with its full set of consumer queues; queues
    /// cannot be added after producers start pushing.
    pub fn new(
        queues: Vec<Arc<BoundedQueue<SignalDataFrame>>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut distributor = QueueDistributor::new();
        for queue in queues {
            distributor.register_queue(queue);
        }
        Self {
            queues: distributor,
            metrics,
        }
    }

    /// Push a frame to every consumer. Returns false when any queue dropped
    /// it.
    pub fn push_frame(&self, frame: SignalDataFrame) -> bool {
        let accepted = self.queues.push(frame);
        let total = self.queues.queue_count();
        for _ in accepted..total {
            self.metrics.inc_queue_drop();
        }
        accepted == total
    }

    /// Push one typed sample.
    pub fn push_signal(
        &self,
        signal_id: SignalId,
        fetch_request_id: FetchRequestId,
        receive_time_ms: u64,
        value: SignalValue,
    ) -> bool {
        self.push_frame(SignalDataFrame::single(
            CollectedSignal::new(signal_id, receive_time_ms, value)
                .with_fetch_request(fetch_request_id),
        ))
    }
}

/// A value ingested by name, before the dictionary assigns its wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum NamedSignalValue {
    Number(f64),
    Text(String),
}

/// Maps fully-qualified signal names onto decoder ids and types.
pub type NamedSignalDictionary = HashMap<String, (SignalId, SignalType)>;

pub struct NamedSignalSource {
    dictionary: RwLock<NamedSignalDictionary>,
    distributor: Arc<SignalDistributor>,
    raw_buffer_manager: Option<Arc<RawBufferManager>>,
    clock: Clock,
}

impl NamedSignalSource {
    pub fn new(
        distributor: Arc<SignalDistributor>,
        raw_buffer_manager: Option<Arc<RawBufferManager>>,
        clock: Clock,
    ) -> Self {
        Self {
            dictionary: RwLock::new(HashMap::new()),
            distributor,
            raw_buffer_manager,
            clock,
        }
    }

    /// Swap the active name dictionary, e.g. when a new decoder manifest
    /// arrives.
    pub fn set_dictionary(&self, dictionary: NamedSignalDictionary) {
        *self.dictionary.write().unwrap() = dictionary;
    }

    pub fn signal_id_for(&self, name: &str) -> Option<SignalId> {
        self.dictionary.read().unwrap().get(name).map(|(id, _)| *id)
    }

    /// Ingest one value by name. `timestamp_ms` of zero means "now".
    pub fn ingest(
        &self,
        timestamp_ms: u64,
        name: &str,
        value: NamedSignalValue,
        fetch_request_id: FetchRequestId,
    ) -> bool {
        self.ingest_multiple(timestamp_ms, &[(name.to_string(), value)], fetch_request_id)
    }

    /// Ingest several name/value pairs sharing one timestamp as one frame.
    pub fn ingest_multiple(
        &self,
        timestamp_ms: u64,
        values: &[(String, NamedSignalValue)],
        fetch_request_id: FetchRequestId,
    ) -> bool {
        let timestamp_ms = if timestamp_ms == 0 {
            self.clock.system_ms()
        } else {
            timestamp_ms
        };
        let mut signals = Vec::with_capacity(values.len());
        // Handles pushed for this frame, pinned until the queue took it.
        let mut pinned = Vec::new();
        {
            let dictionary = self.dictionary.read().unwrap();
            for (name, value) in values {
                let Some((signal_id, signal_type)) = dictionary.get(name) else {
                    debug!("named signal {} is not in the decoder dictionary", name);
                    continue;
                };
                let signal_value = match value {
                    NamedSignalValue::Number(number) => {
                        match signal_value_from_f64(*signal_type, *number) {
                            Some(value) => value,
                            None => {
                                warn!(
                                    "named signal {} declared as {:?} cannot take a number",
                                    name, signal_type
                                );
                                continue;
                            }
                        }
                    }
                    NamedSignalValue::Text(text) => {
                        if *signal_type != SignalType::String {
                            warn!(
                                "named signal {} declared as {:?} cannot take a string",
                                name, signal_type
                            );
                            continue;
                        }
                        let Some(manager) = &self.raw_buffer_manager else {
                            warn!("no raw buffer manager; string signal {} dropped", name);
                            continue;
                        };
                        let handle = manager.push(
                            *signal_id,
                            Bytes::copy_from_slice(text.as_bytes()),
                            timestamp_ms,
                        );
                        if !handle.is_valid() {
                            continue;
                        }
                        manager.increase_usage(
                            *signal_id,
                            handle,
                            UsageStage::CollectedNotInHistory,
                        );
                        pinned.push((*signal_id, handle));
                        SignalValue::RawHandle(handle)
                    }
                };
                signals.push(
                    CollectedSignal::new(*signal_id, timestamp_ms, signal_value)
                        .with_fetch_request(fetch_request_id),
                );
            }
        }
        if signals.is_empty() {
            return false;
        }
        let accepted = self.distributor.push_frame(SignalDataFrame {
            signals,
            active_dtcs: None,
        });
        if let Some(manager) = &self.raw_buffer_manager {
            for (signal_id, handle) in pinned {
                manager.decrease_usage(signal_id, handle, UsageStage::CollectedNotInHistory);
            }
        }
        accepted
    }
}

fn signal_value_from_f64(signal_type: SignalType, value: f64) -> Option<SignalValue> {
    Some(match signal_type {
        SignalType::Uint8 => SignalValue::Uint8(value as u8),
        SignalType::Int8 => SignalValue::Int8(value as i8),
        SignalType::Uint16 => SignalValue::Uint16(value as u16),
        SignalType::Int16 => SignalValue::Int16(value as i16),
        SignalType::Uint32 => SignalValue::Uint32(value as u32),
        SignalType::Int32 => SignalValue::Int32(value as i32),
        SignalType::Uint64 => SignalValue::Uint64(value as u64),
        SignalType::Int64 => SignalValue::Int64(value as i64),
        SignalType::Float32 => SignalValue::Float32(value as f32),
        SignalType::Float64 => SignalValue::Float64(value),
        SignalType::Bool => SignalValue::Bool(value != 0.0),
        SignalType::String => return None,
    })
}
