//! `MULTI_RISING_EDGE_TRIGGER` custom function.
//!
//! Expression signature:
//!
//! ```text
//! custom_function('MULTI_RISING_EDGE_TRIGGER',
//!     'name1', condition1,
//!     'name2', condition2,
//!     ...)
//! ```
//!
//! Takes pairs of a condition name and its boolean value and yields true
//! when any pair has a rising edge since the previous invocation.
//! Additionally it produces the string signal `Vehicle.MultiTriggerInfo`,
//! a JSON array with the names of the conditions that rose, appended to the
//! triggered payload and merged back through the named-signal path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::debug;

use vesper_common::{PayloadSignal, SignalId, SignalType, SignalValue, TriggeredPayload};

use crate::custom::CustomFunction;
use crate::inspection::expr::{ExpressionError, InspectionValue};
use crate::producer::{NamedSignalSource, NamedSignalValue};
use crate::rawbuf::{RawBufferManager, UsageStage};

pub const MULTI_RISING_EDGE_TRIGGER: &str = "MULTI_RISING_EDGE_TRIGGER";
pub const MULTI_TRIGGER_INFO_SIGNAL: &str = "Vehicle.MultiTriggerInfo";

pub struct MultiRisingEdgeTrigger {
    invocation_states: Mutex<HashMap<u64, Vec<bool>>>,
    triggered_conditions: Mutex<Vec<String>>,
    named_signal_source: Arc<NamedSignalSource>,
    raw_buffer_manager: Option<Arc<RawBufferManager>>,
}

impl MultiRisingEdgeTrigger {
    pub fn new(
        named_signal_source: Arc<NamedSignalSource>,
        raw_buffer_manager: Option<Arc<RawBufferManager>>,
    ) -> Self {
        Self {
            invocation_states: Mutex::new(HashMap::new()),
            triggered_conditions: Mutex::new(Vec::new()),
            named_signal_source,
            raw_buffer_manager,
        }
    }
}

impl CustomFunction for MultiRisingEdgeTrigger {
    fn invoke(
        &self,
        invocation_id: u64,
        args: &[InspectionValue],
    ) -> Result<InspectionValue, ExpressionError> {
        if args.is_empty() || args.len() % 2 != 0 {
            return Err(ExpressionError::TypeMismatch);
        }
        let mut names = Vec::with_capacity(args.len() / 2);
        let mut values = Vec::with_capacity(args.len() / 2);
        for pair in args.chunks(2) {
            match (&pair[0], &pair[1]) {
                (InspectionValue::Text(name), InspectionValue::Bool(value)) => {
                    names.push(name.clone());
                    values.push(*value);
                }
                // A pending sub-condition makes the whole check pending.
                (_, InspectionValue::Undefined) | (InspectionValue::Undefined, _) => {
                    return Ok(InspectionValue::Undefined);
                }
                _ => return Err(ExpressionError::TypeMismatch),
            }
        }

        let mut states = self.invocation_states.lock().unwrap();
        let previous = states.entry(invocation_id).or_insert_with(|| vec![false; values.len()]);
        if previous.len() != values.len() {
            // Argument count changed under the same invocation; start over.
            *previous = vec![false; values.len()];
        }
        let mut any_rising = false;
        for (idx, value) in values.iter().enumerate() {
            if *value && !previous[idx] {
                any_rising = true;
                self.triggered_conditions
                    .lock()
                    .unwrap()
                    .push(names[idx].clone());
            }
            previous[idx] = *value;
        }
        Ok(InspectionValue::Bool(any_rising))
    }

    fn condition_end(
        &self,
        collected_signal_ids: &HashSet<SignalId>,
        timestamp_ms: u64,
        payload: &mut TriggeredPayload,
    ) {
        let triggered: Vec<String> =
            std::mem::take(&mut *self.triggered_conditions.lock().unwrap());
        if triggered.is_empty() {
            return;
        }
        let info = serde_json::to_string(&triggered).unwrap_or_default();

        // Merge the info signal back through the named-signal path so
        // history buffers and other schemes see it too.
        self.named_signal_source.ingest(
            timestamp_ms,
            MULTI_TRIGGER_INFO_SIGNAL,
            NamedSignalValue::Text(info.clone()),
            vesper_common::DEFAULT_FETCH_REQUEST_ID,
        );

        let Some(signal_id) = self.named_signal_source.signal_id_for(MULTI_TRIGGER_INFO_SIGNAL)
        else {
            debug!("{} is not in the decoder dictionary", MULTI_TRIGGER_INFO_SIGNAL);
            return;
        };
        if !collected_signal_ids.contains(&signal_id) {
            return;
        }
        let Some(manager) = &self.raw_buffer_manager else {
            return;
        };
        let handle = manager.push(signal_id, Bytes::from(info.into_bytes()), timestamp_ms);
        if !handle.is_valid() {
            return;
        }
        manager.increase_usage(signal_id, handle, UsageStage::SelectedForUpload);
        payload.signals.push(PayloadSignal {
            signal_id,
            timestamp_ms,
            value: SignalValue::RawHandle(handle),
            signal_type: SignalType::String,
        });
    }

    fn cleanup(&self, invocation_id: u64) {
        self.invocation_states.lock().unwrap().remove(&invocation_id);
    }
}
