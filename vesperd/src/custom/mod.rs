//! Custom function host: named functions callable from condition
//! expressions.
//!
//! Implementations register by name before the engine starts; expressions
//! referencing an unknown name still install but evaluate to
//! `NotImplemented`. Each `custom` AST node gets a deterministic invocation
//! id so a function can keep per-invocation state (e.g. previous argument
//! values) across evaluations within one matrix lifetime.

pub mod multi_rising_edge;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;

use vesper_common::{SignalId, TriggeredPayload};

use crate::inspection::expr::{ExpressionError, InspectionValue};

/// Lifecycle callbacks of one custom function.
pub trait CustomFunction: Send + Sync {
    /// Called during expression evaluation. Must complete synchronously; a
    /// function with pending work returns `Undefined`, which the engine
    /// treats as non-triggering.
    fn invoke(
        &self,
        invocation_id: u64,
        args: &[InspectionValue],
    ) -> Result<InspectionValue, ExpressionError>;

    /// Called after a triggered condition was assembled, so the function can
    /// append signals it computed to the outgoing payload.
    fn condition_end(
        &self,
        _collected_signal_ids: &HashSet<SignalId>,
        _timestamp_ms: u64,
        _payload: &mut TriggeredPayload,
    ) {
    }

    /// Called when the AST node behind `invocation_id` is retired.
    fn cleanup(&self, _invocation_id: u64) {}
}

/// Name-keyed registry of custom functions.
#[derive(Default, Clone)]
pub struct CustomFunctionRegistry {
    functions: HashMap<String, Arc<dyn CustomFunction>>,
}

impl CustomFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn CustomFunction>) {
        let name = name.into();
        debug!("registered custom function {}", name);
        self.functions.insert(name, function);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomFunction>> {
        self.functions.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
