//! Collection and inspection engine.
//!
//! Single-threaded core driven by the inspection worker: routes incoming
//! samples into the history buffers, evaluates the conditions whose inputs
//! changed, and assembles payloads for triggered conditions. All state here
//! is owned by the one worker thread; producers only ever reach it through
//! the signal queue.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use vesper_common::{
    DtcInfo, EventId, FetchRequestId, SignalId, SignalValue, SyncId, TimePoint, TriggeredPayload,
    DEFAULT_FETCH_REQUEST_ID,
};

use crate::custom::{CustomFunction, CustomFunctionRegistry};
use crate::inspection::expr::{
    BinaryOperator, ExpressionError, ExpressionNode, InspectionValue, MAX_EVAL_DEPTH,
};
use crate::inspection::history::{
    condition_bit, BufferScope, ConditionBitmap, SignalBufferStore, WindowRead,
    DEFAULT_BUFFER_SCOPE, MAX_ACTIVE_CONDITIONS,
};
use crate::inspection::matrix::{
    ConditionSpec, InspectionMatrix, EVAL_EQUAL_DISTANCE, MAX_SAMPLE_MEMORY_BYTES,
};
use crate::metrics::Metrics;
use crate::queue::BoundedQueue;
use crate::rawbuf::{RawBufferManager, UsageStage};

/// Default minimum interval between two emissions of the same fetch id.
pub const MIN_FETCH_TRIGGER_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("inspection matrix needs {requested} bytes of sample memory, limit is {limit}")]
    MatrixAllocationFailed { requested: usize, limit: usize },
    #[error("inspection matrix has {count} conditions, at most {max} are supported")]
    TooManyConditions { count: usize, max: usize },
}

/// Where a condition finds one of its signals.
#[derive(Debug, Clone, Copy)]
struct BufferRef {
    scope: BufferScope,
    interval_ms: u32,
}

/// Where a condition finds the window over one of its signals.
#[derive(Debug, Clone, Copy)]
struct WindowRef {
    scope: BufferScope,
    interval_ms: u32,
    window_size_ms: u64,
}

/// Runtime state of one condition; everything else lives in the immutable
/// matrix snapshot at the same index.
#[derive(Debug, Default)]
struct ActiveCondition {
    last_published_timestamp_ms: u64,
    last_trigger: TimePoint,
    signal_buffers: HashMap<SignalId, BufferRef>,
    window_refs: HashMap<SignalId, WindowRef>,
    collected_signal_ids: HashSet<SignalId>,
    event_id: EventId,
}

pub struct InspectionEngine {
    store: SignalBufferStore,
    conditions: Vec<ActiveCondition>,
    active_matrix: Option<Arc<InspectionMatrix>>,
    fetch_scopes: HashMap<FetchRequestId, BufferScope>,
    /// Conditions whose inputs (signal value or window) changed since the
    /// last evaluation pass.
    conditions_with_input_changed: ConditionBitmap,
    /// Conditions whose last evaluation yielded true.
    conditions_currently_true: ConditionBitmap,
    /// Conditions triggered and waiting for their data to be collected.
    conditions_triggered_waiting: ConditionBitmap,
    /// Fetch requests whose gating evaluation last yielded true, indexed by
    /// fetch request id.
    fetch_conditions_currently_true: ConditionBitmap,
    /// Conditions that already attached the current DTC snapshot.
    dtcs_attached: ConditionBitmap,
    active_dtcs: Option<DtcInfo>,
    next_condition_to_collect: usize,
    next_window_times_out_ms: u64,
    send_data_only_once_per_condition: bool,
    min_fetch_trigger_ms: u64,
    last_fetch_trigger: HashMap<FetchRequestId, u64>,
    raw_buffer_manager: Option<Arc<RawBufferManager>>,
    fetch_queue: Option<Arc<BoundedQueue<FetchRequestId>>>,
    custom_functions: CustomFunctionRegistry,
    /// Deterministic invocation id per custom AST node of the active matrix,
    /// keyed by node address.
    invocation_ids: HashMap<usize, u64>,
    event_counter: AtomicU8,
    metrics: Arc<Metrics>,
}

impl InspectionEngine {
    pub fn new(
        raw_buffer_manager: Option<Arc<RawBufferManager>>,
        fetch_queue: Option<Arc<BoundedQueue<FetchRequestId>>>,
        send_data_only_once_per_condition: bool,
        min_fetch_trigger_ms: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store: SignalBufferStore::new(),
            conditions: Vec::new(),
            active_matrix: None,
            fetch_scopes: HashMap::new(),
            conditions_with_input_changed: 0,
            conditions_currently_true: 0,
            conditions_triggered_waiting: 0,
            fetch_conditions_currently_true: 0,
            dtcs_attached: 0,
            active_dtcs: None,
            next_condition_to_collect: 0,
            next_window_times_out_ms: u64::MAX,
            send_data_only_once_per_condition,
            min_fetch_trigger_ms,
            last_fetch_trigger: HashMap::new(),
            raw_buffer_manager,
            fetch_queue,
            custom_functions: CustomFunctionRegistry::new(),
            invocation_ids: HashMap::new(),
            event_counter: AtomicU8::new(0),
            metrics,
        }
    }

    pub fn register_custom_function(
        &mut self,
        name: impl Into<String>,
        function: Arc<dyn CustomFunction>,
    ) {
        self.custom_functions.register(name, function);
    }

    /// Swap in a new inspection matrix.
    ///
    /// The replacement store is fully built and validated before anything is
    /// committed; on failure the previously active matrix stays installed
    /// untouched.
    pub fn on_change_inspection_matrix(
        &mut self,
        matrix: Arc<InspectionMatrix>,
        now: TimePoint,
    ) -> Result<(), EngineError> {
        if matrix.conditions.len() > MAX_ACTIVE_CONDITIONS {
            self.metrics.inc_matrix_swap_failures();
            return Err(EngineError::TooManyConditions {
                count: matrix.conditions.len(),
                max: MAX_ACTIVE_CONDITIONS,
            });
        }

        // Fetch-scoped buffers: every distinct fetch request id used by the
        // matrix gets its own scope so duplicate signals from different
        // fetches stay isolated.
        let mut fetch_scopes: HashMap<FetchRequestId, BufferScope> = HashMap::new();
        fetch_scopes.insert(DEFAULT_FETCH_REQUEST_ID, DEFAULT_BUFFER_SCOPE);
        let mut next_scope: BufferScope = 1;
        let mut scope_for = |fetch_scopes: &mut HashMap<FetchRequestId, BufferScope>,
                             id: FetchRequestId| {
            *fetch_scopes.entry(id).or_insert_with(|| {
                let scope = next_scope;
                next_scope += 1;
                scope
            })
        };

        let mut store = SignalBufferStore::new();
        for spec in &matrix.conditions {
            for signal in &spec.signals {
                let scope = scope_for(&mut fetch_scopes, signal.fetch_request_id);
                if !store.ensure_buffer(
                    scope,
                    signal.signal_id,
                    signal.signal_type,
                    signal.sample_buffer_size,
                    signal.minimum_sample_interval_ms,
                    signal.fixed_window_period_ms,
                ) {
                    warn!(
                        "scheme {} drops signal {} due to a type conflict",
                        spec.scheme_id, signal.signal_id
                    );
                }
            }
            for fetch_id in spec.condition.referenced_fetch_requests() {
                scope_for(&mut fetch_scopes, fetch_id);
            }
        }

        let requested = store.total_sample_bytes();
        if requested > MAX_SAMPLE_MEMORY_BYTES {
            self.metrics.inc_matrix_swap_failures();
            return Err(EngineError::MatrixAllocationFailed {
                requested,
                limit: MAX_SAMPLE_MEMORY_BYTES,
            });
        }
        store.allocate_all();

        // Condition rows: buffer and window references plus the evaluation
        // subscriptions that drive the dirty bitmap.
        let mut conditions = Vec::with_capacity(matrix.conditions.len());
        for (idx, spec) in matrix.conditions.iter().enumerate() {
            let mut condition = ActiveCondition::default();
            for signal in &spec.signals {
                let scope = *fetch_scopes
                    .get(&signal.fetch_request_id)
                    .unwrap_or(&DEFAULT_BUFFER_SCOPE);
                condition.signal_buffers.insert(
                    signal.signal_id,
                    BufferRef {
                        scope,
                        interval_ms: signal.minimum_sample_interval_ms,
                    },
                );
                if signal.fixed_window_period_ms != 0 {
                    condition.window_refs.insert(
                        signal.signal_id,
                        WindowRef {
                            scope,
                            interval_ms: signal.minimum_sample_interval_ms,
                            window_size_ms: signal.fixed_window_period_ms,
                        },
                    );
                }
                if !signal.is_condition_only {
                    condition.collected_signal_ids.insert(signal.signal_id);
                }
            }
            for signal_id in spec.condition.referenced_signals() {
                if let Some(buffer_ref) = condition.signal_buffers.get(&signal_id) {
                    store.subscribe_condition(
                        buffer_ref.scope,
                        signal_id,
                        buffer_ref.interval_ms,
                        idx,
                    );
                }
            }
            conditions.push(condition);
        }

        // Deterministic invocation ids for custom function nodes, and
        // cleanup callbacks for the ids the new matrix no longer carries.
        let mut invocation_ids = HashMap::new();
        let mut new_ids: HashSet<u64> = HashSet::new();
        for spec in &matrix.conditions {
            let mut ordinal: u32 = 0;
            spec.condition.visit(&mut |node| {
                if let ExpressionNode::Custom { .. } = node {
                    let id = invocation_id(&spec.scheme_id, ordinal);
                    invocation_ids.insert(node as *const ExpressionNode as usize, id);
                    new_ids.insert(id);
                    ordinal += 1;
                }
            });
        }
        if let Some(old_matrix) = &self.active_matrix {
            for spec in &old_matrix.conditions {
                spec.condition.visit(&mut |node| {
                    if let ExpressionNode::Custom { function_name, .. } = node {
                        let key = node as *const ExpressionNode as usize;
                        if let Some(old_id) = self.invocation_ids.get(&key) {
                            if !new_ids.contains(old_id) {
                                if let Some(function) = self.custom_functions.get(function_name) {
                                    function.cleanup(*old_id);
                                }
                            }
                        }
                    }
                });
            }
        }

        // Retire the old buffers: any raw handles they pinned are released.
        if let Some(manager) = &self.raw_buffer_manager {
            self.store.release_all_handles(manager);
        }

        self.store = store;
        self.conditions = conditions;
        self.fetch_scopes = fetch_scopes;
        self.invocation_ids = invocation_ids;
        self.conditions_with_input_changed = 0;
        self.conditions_currently_true = 0;
        self.conditions_triggered_waiting = 0;
        self.fetch_conditions_currently_true = 0;
        self.dtcs_attached = 0;
        self.next_condition_to_collect = 0;
        self.next_window_times_out_ms = u64::MAX;
        self.active_matrix = Some(Arc::clone(&matrix));
        self.metrics.inc_matrix_swaps();
        self.metrics.set_active_conditions(matrix.conditions.len());
        info!(
            "inspection matrix applied: {} conditions, {} sample bytes",
            matrix.conditions.len(),
            requested
        );

        // Static conditions have no signal inputs; evaluate them once here.
        for idx in 0..matrix.conditions.len() {
            if matrix.conditions[idx].is_static {
                let spec = &matrix.conditions[idx];
                match self.eval(&spec.condition, idx, now, MAX_EVAL_DEPTH) {
                    Ok(InspectionValue::Bool(true)) => {
                        self.note_condition_true(idx, spec.trigger_only_on_rising_edge, now);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        self.metrics.inc_eval_error();
                        debug!(
                            "static condition {} failed to evaluate: {}",
                            spec.scheme_id,
                            error.as_str()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Route one decoded sample into the history buffers of its fetch scope.
    pub fn add_new_signal(
        &mut self,
        signal_id: SignalId,
        fetch_request_id: FetchRequestId,
        receive_time: TimePoint,
        monotonic_now_ms: u64,
        value: SignalValue,
    ) {
        let scope = self
            .fetch_scopes
            .get(&fetch_request_id)
            .copied()
            .unwrap_or(DEFAULT_BUFFER_SCOPE);
        let dirty = self.store.insert_sample(
            scope,
            signal_id,
            value,
            receive_time,
            monotonic_now_ms,
            self.raw_buffer_manager.as_deref(),
            &mut self.next_window_times_out_ms,
        );
        self.conditions_with_input_changed |= dirty;
    }

    /// Install a fresh DTC snapshot; every condition may attach it once.
    pub fn set_active_dtcs(&mut self, active_dtcs: DtcInfo) {
        self.active_dtcs = Some(active_dtcs);
        self.dtcs_attached = 0;
    }

    /// Evaluate every condition whose inputs changed. Returns true when at
    /// least one condition is triggered and waiting to publish.
    pub fn evaluate_conditions(&mut self, now: TimePoint) -> bool {
        let Some(matrix) = self.active_matrix.clone() else {
            return false;
        };

        // Windows complete on time passage, with or without fresh samples.
        if now.monotonic_time_ms >= self.next_window_times_out_ms {
            let mut next = u64::MAX;
            let dirty = self
                .store
                .advance_all_windows(now.monotonic_time_ms, &mut next);
            self.next_window_times_out_ms = next;
            self.conditions_with_input_changed |= dirty;
        }

        let dirty = self.conditions_with_input_changed;
        self.conditions_with_input_changed = 0;

        for idx in 0..matrix.conditions.len() {
            if dirty & condition_bit(idx) == 0 {
                continue;
            }
            let spec = &matrix.conditions[idx];
            match self.eval(&spec.condition, idx, now, MAX_EVAL_DEPTH) {
                Ok(InspectionValue::Bool(true)) => {
                    self.note_condition_true(idx, spec.trigger_only_on_rising_edge, now);
                }
                Ok(_) => {
                    self.conditions_currently_true &= !condition_bit(idx);
                }
                Err(error) => {
                    self.conditions_currently_true &= !condition_bit(idx);
                    self.metrics.inc_eval_error();
                    debug!(
                        "condition {} failed to evaluate: {}",
                        spec.scheme_id,
                        error.as_str()
                    );
                }
            }
        }
        self.conditions_triggered_waiting != 0
    }

    fn note_condition_true(&mut self, idx: usize, rising_edge_only: bool, now: TimePoint) {
        let bit = condition_bit(idx);
        let was_true = self.conditions_currently_true & bit != 0;
        self.conditions_currently_true |= bit;
        if rising_edge_only && was_true {
            return;
        }
        if self.conditions_triggered_waiting & bit == 0 {
            self.conditions_triggered_waiting |= bit;
            let condition = &mut self.conditions[idx];
            condition.last_trigger = now;
            condition.event_id = generate_event_id(
                &self.event_counter,
                now.system_time_ms,
            );
            self.metrics.inc_conditions_triggered();
        }
    }

    /// Assemble the payload of the next triggered condition, round-robin.
    ///
    /// Returns the payload (None when nothing is due) and how many
    /// milliseconds the caller may sleep before the next scheduled work:
    /// the nearest window boundary or post-trigger collection deadline.
    pub fn collect_next_data_to_send(
        &mut self,
        now: TimePoint,
    ) -> (Option<TriggeredPayload>, u64) {
        let mut wait_ms = u64::MAX;
        if self.next_window_times_out_ms != u64::MAX {
            wait_ms = self
                .next_window_times_out_ms
                .saturating_sub(now.monotonic_time_ms);
        }
        let Some(matrix) = self.active_matrix.clone() else {
            return (None, wait_ms);
        };
        let count = matrix.conditions.len();
        if count == 0 || self.conditions_triggered_waiting == 0 {
            return (None, wait_ms);
        }

        // Post-trigger collection windows of every waiting condition bound
        // the sleep, not only the one collected now.
        for idx in 0..count {
            if self.conditions_triggered_waiting & condition_bit(idx) == 0 {
                continue;
            }
            let after = u64::from(matrix.conditions[idx].after_duration_ms);
            if after > 0 {
                let due = self.conditions[idx].last_trigger.monotonic_time_ms + after;
                if now.monotonic_time_ms < due {
                    wait_ms = wait_ms.min(due - now.monotonic_time_ms);
                }
            }
        }

        for offset in 0..count {
            let idx = (self.next_condition_to_collect + offset) % count;
            if self.conditions_triggered_waiting & condition_bit(idx) == 0 {
                continue;
            }
            let spec = &matrix.conditions[idx];
            let after = u64::from(spec.after_duration_ms);
            if after > 0
                && now.monotonic_time_ms < self.conditions[idx].last_trigger.monotonic_time_ms + after
            {
                continue;
            }
            self.conditions_triggered_waiting &= !condition_bit(idx);
            self.next_condition_to_collect = (idx + 1) % count;
            let payload = self.collect_condition_data(spec, idx);
            return (Some(payload), wait_ms);
        }

        (None, wait_ms)
    }

    fn collect_condition_data(&mut self, spec: &ConditionSpec, idx: usize) -> TriggeredPayload {
        let trigger_time_ms = self.conditions[idx].last_trigger.system_time_ms;
        let published_before = if self.send_data_only_once_per_condition {
            Some(self.conditions[idx].last_published_timestamp_ms)
        } else {
            None
        };
        let mut payload = TriggeredPayload {
            scheme_id: spec.scheme_id.clone(),
            event_id: self.conditions[idx].event_id,
            trigger_time_ms,
            signals: Vec::new(),
            active_dtcs: None,
        };

        let mut newest_timestamp_ms = 0;
        for signal in &spec.signals {
            if signal.is_condition_only {
                continue;
            }
            let Some(buffer_ref) = self.conditions[idx].signal_buffers.get(&signal.signal_id)
            else {
                continue;
            };
            let buffer_ref = *buffer_ref;
            if let Some(typed) = self.store.get_mut(buffer_ref.scope, signal.signal_id) {
                typed.collect_newest(
                    signal.signal_id,
                    buffer_ref.interval_ms,
                    signal.sample_buffer_size,
                    idx,
                    published_before,
                    self.raw_buffer_manager.as_deref(),
                    &mut newest_timestamp_ms,
                    &mut payload.signals,
                );
            }
        }
        {
            let condition = &mut self.conditions[idx];
            condition.last_published_timestamp_ms =
                condition.last_published_timestamp_ms.max(newest_timestamp_ms);
        }

        if spec.include_active_dtcs {
            let bit = condition_bit(idx);
            if self.dtcs_attached & bit == 0 {
                if let Some(active_dtcs) = &self.active_dtcs {
                    payload.active_dtcs = Some(active_dtcs.clone());
                    self.dtcs_attached |= bit;
                }
            }
        }

        // Give the condition's custom functions the chance to append the
        // signals they computed.
        let collected_ids = self.conditions[idx].collected_signal_ids.clone();
        spec.condition.visit(&mut |node| {
            if let ExpressionNode::Custom { function_name, .. } = node {
                if let Some(function) = self.custom_functions.get(function_name) {
                    function.condition_end(&collected_ids, trigger_time_ms, &mut payload);
                }
            }
        });

        payload
    }

    /// Latest value of a signal from the condition's buffers, for expression
    /// evaluation.
    fn latest_signal_value(
        &self,
        signal_id: SignalId,
        condition_idx: usize,
    ) -> Result<InspectionValue, ExpressionError> {
        let buffer_ref = self.conditions[condition_idx]
            .signal_buffers
            .get(&signal_id)
            .ok_or(ExpressionError::SignalNotFound)?;
        let typed = self
            .store
            .get(buffer_ref.scope, signal_id)
            .ok_or(ExpressionError::SignalNotFound)?;
        let (value, _, _) = typed
            .newest_value(buffer_ref.interval_ms, condition_idx)
            .ok_or(ExpressionError::SignalNotFound)?;
        match value {
            SignalValue::Bool(b) => Ok(InspectionValue::Bool(b)),
            SignalValue::RawHandle(handle) => {
                let manager = self
                    .raw_buffer_manager
                    .as_ref()
                    .ok_or(ExpressionError::NotImplemented)?;
                let bytes = manager
                    .borrow(signal_id, handle)
                    .ok_or(ExpressionError::SignalNotFound)?;
                Ok(InspectionValue::Text(
                    String::from_utf8_lossy(&bytes).into_owned(),
                ))
            }
            other => other
                .as_f64()
                .map(InspectionValue::Number)
                .ok_or(ExpressionError::TypeMismatch),
        }
    }

    fn trigger_fetch(&mut self, fetch_request_id: FetchRequestId, now: TimePoint) {
        let due = self
            .last_fetch_trigger
            .get(&fetch_request_id)
            .map(|last| now.monotonic_time_ms >= last + self.min_fetch_trigger_ms)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_fetch_trigger
            .insert(fetch_request_id, now.monotonic_time_ms);
        if (fetch_request_id as usize) < MAX_ACTIVE_CONDITIONS {
            self.fetch_conditions_currently_true |= condition_bit(fetch_request_id as usize);
        }
        if let Some(queue) = &self.fetch_queue {
            if queue.push(fetch_request_id) {
                self.metrics.inc_fetch_requests();
            } else {
                self.metrics.inc_queue_drop();
            }
        }
    }

    fn eval(
        &mut self,
        node: &ExpressionNode,
        condition_idx: usize,
        now: TimePoint,
        remaining_depth: u32,
    ) -> Result<InspectionValue, ExpressionError> {
        if remaining_depth == 0 {
            return Err(ExpressionError::StackOverflow);
        }
        let depth = remaining_depth - 1;
        match node {
            ExpressionNode::Boolean { value } => Ok(InspectionValue::Bool(*value)),
            ExpressionNode::Number { value } => Ok(InspectionValue::Number(*value)),
            ExpressionNode::Text { value } => Ok(InspectionValue::Text(value.clone())),
            ExpressionNode::Signal { signal_id } => {
                self.latest_signal_value(*signal_id, condition_idx)
            }
            ExpressionNode::Window {
                function,
                signal_id,
            } => {
                let window_ref = self.conditions[condition_idx]
                    .window_refs
                    .get(signal_id)
                    .ok_or(ExpressionError::SignalNotFound)?;
                let typed = self
                    .store
                    .get(window_ref.scope, *signal_id)
                    .ok_or(ExpressionError::SignalNotFound)?;
                match typed.window_value(window_ref.interval_ms, window_ref.window_size_ms, *function)
                {
                    WindowRead::NoWindow => Err(ExpressionError::SignalNotFound),
                    // An incomplete window is normal early on, not an error.
                    WindowRead::NotAvailable => Ok(InspectionValue::Undefined),
                    WindowRead::Value(value) => Ok(InspectionValue::Number(value)),
                }
            }
            ExpressionNode::IsNew { signal_id } => {
                let buffer_ref = self.conditions[condition_idx]
                    .signal_buffers
                    .get(signal_id)
                    .ok_or(ExpressionError::SignalNotFound)?;
                let fresh = self
                    .store
                    .get(buffer_ref.scope, *signal_id)
                    .and_then(|typed| typed.newest_value(buffer_ref.interval_ms, condition_idx))
                    .map(|(_, _, consumed)| !consumed)
                    .unwrap_or(false);
                Ok(InspectionValue::Bool(fresh))
            }
            ExpressionNode::Not { operand } => {
                match self.eval(operand, condition_idx, now, depth)? {
                    InspectionValue::Bool(b) => Ok(InspectionValue::Bool(!b)),
                    InspectionValue::Undefined => Ok(InspectionValue::Undefined),
                    _ => Err(ExpressionError::TypeMismatch),
                }
            }
            ExpressionNode::Binary {
                operator,
                left,
                right,
            } => self.eval_binary(*operator, left, right, condition_idx, now, depth),
            ExpressionNode::If {
                condition,
                then_branch,
                else_branch,
            } => match self.eval(condition, condition_idx, now, depth)? {
                InspectionValue::Bool(true) => self.eval(then_branch, condition_idx, now, depth),
                InspectionValue::Bool(false) => self.eval(else_branch, condition_idx, now, depth),
                InspectionValue::Undefined => Ok(InspectionValue::Undefined),
                _ => Err(ExpressionError::TypeMismatch),
            },
            ExpressionNode::Custom {
                function_name,
                args,
            } => {
                let Some(function) = self.custom_functions.get(function_name).cloned() else {
                    return Err(ExpressionError::NotImplemented);
                };
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, condition_idx, now, depth)?);
                }
                let invocation = self
                    .invocation_ids
                    .get(&(node as *const ExpressionNode as usize))
                    .copied()
                    .unwrap_or(0);
                function.invoke(invocation, &values)
            }
            ExpressionNode::ActiveDtcQuery => Ok(InspectionValue::Bool(
                self.active_dtcs
                    .as_ref()
                    .map(DtcInfo::has_codes)
                    .unwrap_or(false),
            )),
            ExpressionNode::FetchRequest { fetch_request_id } => {
                self.trigger_fetch(*fetch_request_id, now);
                Ok(InspectionValue::Bool(true))
            }
        }
    }

    fn eval_binary(
        &mut self,
        operator: BinaryOperator,
        left: &ExpressionNode,
        right: &ExpressionNode,
        condition_idx: usize,
        now: TimePoint,
        depth: u32,
    ) -> Result<InspectionValue, ExpressionError> {
        use BinaryOperator::*;

        // AND/OR short-circuit: the right operand is not evaluated when the
        // left already decides the result.
        if operator == And || operator == Or {
            let lhs = self.eval(left, condition_idx, now, depth)?;
            let decided = match (&lhs, operator) {
                (InspectionValue::Bool(false), And) => Some(InspectionValue::Bool(false)),
                (InspectionValue::Bool(true), Or) => Some(InspectionValue::Bool(true)),
                (InspectionValue::Undefined, _) => Some(InspectionValue::Undefined),
                (InspectionValue::Bool(_), _) => None,
                _ => return Err(ExpressionError::TypeMismatch),
            };
            if let Some(result) = decided {
                return Ok(result);
            }
            return match self.eval(right, condition_idx, now, depth)? {
                InspectionValue::Bool(b) => Ok(InspectionValue::Bool(b)),
                InspectionValue::Undefined => Ok(InspectionValue::Undefined),
                _ => Err(ExpressionError::TypeMismatch),
            };
        }

        let lhs = self.eval(left, condition_idx, now, depth)?;
        let rhs = self.eval(right, condition_idx, now, depth)?;
        if lhs.is_undefined() || rhs.is_undefined() {
            return Ok(InspectionValue::Undefined);
        }

        match operator {
            Eq | Neq => {
                let equal = match (&lhs, &rhs) {
                    (InspectionValue::Text(a), InspectionValue::Text(b)) => a == b,
                    _ => {
                        let a = lhs.as_number().ok_or(ExpressionError::TypeMismatch)?;
                        let b = rhs.as_number().ok_or(ExpressionError::TypeMismatch)?;
                        (a - b).abs() < EVAL_EQUAL_DISTANCE
                    }
                };
                Ok(InspectionValue::Bool(if operator == Eq {
                    equal
                } else {
                    !equal
                }))
            }
            Lt | Le | Gt | Ge => {
                let a = lhs.as_number().ok_or(ExpressionError::TypeMismatch)?;
                let b = rhs.as_number().ok_or(ExpressionError::TypeMismatch)?;
                Ok(InspectionValue::Bool(match operator {
                    Lt => a < b,
                    Le => a <= b,
                    Gt => a > b,
                    _ => a >= b,
                }))
            }
            Add | Sub | Mul | Div | Mod => {
                let a = lhs.as_number().ok_or(ExpressionError::TypeMismatch)?;
                let b = rhs.as_number().ok_or(ExpressionError::TypeMismatch)?;
                let result = match operator {
                    Add => a + b,
                    Sub => a - b,
                    Mul => a * b,
                    Div | Mod => {
                        if b == 0.0 {
                            return Err(ExpressionError::TypeMismatch);
                        }
                        if operator == Div {
                            a / b
                        } else {
                            a % b
                        }
                    }
                    _ => unreachable!(),
                };
                Ok(InspectionValue::Number(result))
            }
            BitAnd | BitOr => {
                let a = to_bits(lhs.as_number().ok_or(ExpressionError::TypeMismatch)?)?;
                let b = to_bits(rhs.as_number().ok_or(ExpressionError::TypeMismatch)?)?;
                let result = if operator == BitAnd { a & b } else { a | b };
                Ok(InspectionValue::Number(result as f64))
            }
            And | Or => unreachable!(),
        }
    }
}

fn to_bits(value: f64) -> Result<u64, ExpressionError> {
    if !value.is_finite() || value < 0.0 || value > u64::MAX as f64 {
        return Err(ExpressionError::Overflow);
    }
    Ok(value.trunc() as u64)
}

/// 32-bit event id: lower 3 bytes of the trigger timestamp plus one byte of
/// a per-engine wrapping counter.
fn generate_event_id(counter: &AtomicU8, timestamp_ms: u64) -> EventId {
    let count = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    (u32::from(count) << 24) | ((timestamp_ms & 0xFF_FFFF) as u32)
}

fn invocation_id(scheme_id: &SyncId, ordinal: u32) -> u64 {
    // FNV-1a over the scheme id and node ordinal; stable across identical
    // matrix swaps.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in scheme_id.as_bytes().iter().chain(&ordinal.to_le_bytes()) {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Release the selected-for-upload use counts of every handle in a payload
/// that will never reach the sender (e.g. because the outbound queue was
/// full).
pub fn release_payload_handles(payload: &TriggeredPayload, manager: &RawBufferManager) {
    for signal in &payload.signals {
        if let SignalValue::RawHandle(handle) = signal.value {
            manager.decrease_usage(signal.signal_id, handle, UsageStage::SelectedForUpload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawBufConfig;
    use crate::inspection::history::WindowFunction;
    use crate::inspection::matrix::SignalCollectionInfo;
    use bytes::Bytes;
    use std::sync::Mutex;
    use vesper_common::SignalType;

    const BASE: u64 = 1_700_000_000_000;

    fn tp(monotonic: u64) -> TimePoint {
        TimePoint::new(BASE + monotonic, monotonic)
    }

    fn sig(signal_id: SignalId) -> ExpressionNode {
        ExpressionNode::Signal { signal_id }
    }

    fn num(value: f64) -> ExpressionNode {
        ExpressionNode::Number { value }
    }

    fn gt(left: ExpressionNode, right: ExpressionNode) -> ExpressionNode {
        ExpressionNode::Binary {
            operator: BinaryOperator::Gt,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn binary(operator: BinaryOperator, left: ExpressionNode, right: ExpressionNode) -> ExpressionNode {
        ExpressionNode::Binary {
            operator,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn f64_signal(signal_id: SignalId, size: usize, interval_ms: u32) -> SignalCollectionInfo {
        SignalCollectionInfo {
            signal_id,
            sample_buffer_size: size,
            minimum_sample_interval_ms: interval_ms,
            fixed_window_period_ms: 0,
            is_condition_only: false,
            signal_type: SignalType::Float64,
            fetch_request_id: DEFAULT_FETCH_REQUEST_ID,
        }
    }

    fn single_condition_matrix(condition: ConditionSpec) -> Arc<InspectionMatrix> {
        Arc::new(InspectionMatrix {
            conditions: vec![condition],
        })
    }

    fn engine() -> InspectionEngine {
        InspectionEngine::new(None, None, true, MIN_FETCH_TRIGGER_MS, Arc::new(Metrics::new()))
    }

    fn engine_with(
        raw: Option<Arc<RawBufferManager>>,
        fetch_queue: Option<Arc<BoundedQueue<FetchRequestId>>>,
    ) -> InspectionEngine {
        InspectionEngine::new(raw, fetch_queue, true, MIN_FETCH_TRIGGER_MS, Arc::new(Metrics::new()))
    }

    fn push(engine: &mut InspectionEngine, signal_id: SignalId, monotonic: u64, value: f64) {
        engine.add_new_signal(
            signal_id,
            DEFAULT_FETCH_REQUEST_ID,
            tp(monotonic),
            monotonic,
            SignalValue::Float64(value),
        );
    }

    #[test]
    fn subsampled_ring_triggers_once_on_rising_edge() {
        // One condition, one F64 signal, capacity 4, min interval 10ms.
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "s1".to_string(),
            condition: gt(sig(1), num(2.5)),
            signals: vec![f64_signal(1, 4, 10)],
            trigger_only_on_rising_edge: true,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        push(&mut e, 1, 0, 1.0);
        assert!(!e.evaluate_conditions(tp(0)));
        // 5ms: below the sampling interval, dropped.
        push(&mut e, 1, 5, 2.0);
        assert!(!e.evaluate_conditions(tp(5)));
        // 10ms: accepted, crosses the threshold.
        push(&mut e, 1, 10, 3.0);
        assert!(e.evaluate_conditions(tp(10)));
        // 20ms: accepted, still true; rising edge does not re-trigger.
        push(&mut e, 1, 20, 4.0);
        e.evaluate_conditions(tp(20));

        let (payload, _) = e.collect_next_data_to_send(tp(20));
        let payload = payload.unwrap();
        assert_eq!(payload.scheme_id, "s1");
        let values: Vec<f64> = payload
            .signals
            .iter()
            .map(|s| match s.value {
                SignalValue::Float64(v) => v,
                _ => panic!("unexpected type"),
            })
            .collect();
        // Newest first; the 2.0 sample was subsampled away.
        assert_eq!(values, vec![4.0, 3.0, 1.0]);
        let (none, _) = e.collect_next_data_to_send(tp(20));
        assert!(none.is_none());
    }

    #[test]
    fn window_average_feeds_conditions() {
        // WINDOW(last_avg) over 1000ms windows, compared against 15.
        let mut e = engine();
        let mut signal = f64_signal(1, 4, 0);
        signal.fixed_window_period_ms = 1000;
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "window".to_string(),
            condition: gt(
                ExpressionNode::Window {
                    function: WindowFunction::LastAvg,
                    signal_id: 1,
                },
                num(15.0),
            ),
            signals: vec![signal],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        push(&mut e, 1, 0, 10.0);
        push(&mut e, 1, 300, 20.0);
        push(&mut e, 1, 600, 30.0);
        // Window not complete: evaluation yields Undefined, no trigger and
        // no error counted.
        assert!(!e.evaluate_conditions(tp(600)));
        assert_eq!(e.metrics.eval_errors(), 0);

        // Crossing t=1000 completes the window: avg {10,20,30} = 20 > 15.
        push(&mut e, 1, 1100, 40.0);
        assert!(e.evaluate_conditions(tp(1100)));
    }

    #[test]
    fn windows_complete_on_silence() {
        let mut e = engine();
        let mut signal = f64_signal(1, 4, 0);
        signal.fixed_window_period_ms = 1000;
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "silent".to_string(),
            condition: gt(
                ExpressionNode::Window {
                    function: WindowFunction::LastMax,
                    signal_id: 1,
                },
                num(5.0),
            ),
            signals: vec![signal],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        push(&mut e, 1, 100, 9.0);
        assert!(!e.evaluate_conditions(tp(100)));
        // No further samples; pure time passage completes the window.
        assert!(e.evaluate_conditions(tp(1200)));
    }

    #[test]
    fn send_once_per_condition_skips_published_samples() {
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "once".to_string(),
            condition: gt(sig(1), num(0.0)),
            signals: vec![f64_signal(1, 10, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        push(&mut e, 1, 1, 1.0);
        push(&mut e, 1, 2, 2.0);
        e.evaluate_conditions(tp(2));
        let (payload1, _) = e.collect_next_data_to_send(tp(2));
        let payload1 = payload1.unwrap();
        assert_eq!(payload1.signals.len(), 2);

        push(&mut e, 1, 3, 3.0);
        push(&mut e, 1, 4, 4.0);
        e.evaluate_conditions(tp(4));
        let (payload2, _) = e.collect_next_data_to_send(tp(4));
        let payload2 = payload2.unwrap();
        // Only samples newer than what payload 1 published.
        assert_eq!(payload2.signals.len(), 2);
        for signal in &payload2.signals {
            assert!(signal.timestamp_ms > BASE + 2);
        }
    }

    #[test]
    fn rising_edge_triggers_exactly_twice() {
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "edge".to_string(),
            condition: gt(sig(1), num(1.0)),
            signals: vec![f64_signal(1, 10, 0)],
            trigger_only_on_rising_edge: true,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        let mut payloads = 0;
        for (t, v) in [(1, 0.5), (2, 1.5), (3, 2.0), (4, 0.0), (5, 3.0)] {
            push(&mut e, 1, t, v);
            e.evaluate_conditions(tp(t));
            while let (Some(_), _) = e.collect_next_data_to_send(tp(t)) {
                payloads += 1;
            }
        }
        assert_eq!(payloads, 2);
    }

    #[test]
    fn string_handles_follow_ring_lifecycle() {
        let manager = Arc::new(RawBufferManager::new(&RawBufConfig::default()));
        let mut e = engine_with(Some(Arc::clone(&manager)), None);
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "vin".to_string(),
            condition: ExpressionNode::Boolean { value: false },
            signals: vec![SignalCollectionInfo {
                signal_id: 7,
                sample_buffer_size: 2,
                minimum_sample_interval_ms: 0,
                fixed_window_period_ms: 0,
                is_condition_only: false,
                signal_type: SignalType::String,
                fetch_request_id: DEFAULT_FETCH_REQUEST_ID,
            }],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        let h1 = manager.push(7, Bytes::from_static(b"one"), BASE);
        let h2 = manager.push(7, Bytes::from_static(b"two"), BASE + 1);
        let h3 = manager.push(7, Bytes::from_static(b"three"), BASE + 2);
        for (t, h) in [(0, h1), (1, h2), (2, h3)] {
            e.add_new_signal(7, DEFAULT_FETCH_REQUEST_ID, tp(t), t, SignalValue::RawHandle(h));
        }
        // Capacity 2: the insert of h3 released the overwritten h1.
        assert_eq!(manager.usage_count(7, h1, UsageStage::HistoryBuffer), 0);
        assert_eq!(manager.usage_count(7, h2, UsageStage::HistoryBuffer), 1);
        assert_eq!(manager.usage_count(7, h3, UsageStage::HistoryBuffer), 1);

        // A matrix swap retires the ring and releases the survivors too.
        e.on_change_inspection_matrix(
            Arc::new(InspectionMatrix::default()),
            tp(3),
        )
        .unwrap();
        assert_eq!(manager.usage_count(7, h2, UsageStage::HistoryBuffer), 0);
        assert_eq!(manager.usage_count(7, h3, UsageStage::HistoryBuffer), 0);
    }

    #[test]
    fn fetch_requests_are_throttled_per_id() {
        let queue = Arc::new(BoundedQueue::new(100, "fetch"));
        let mut e = engine_with(None, Some(Arc::clone(&queue)));
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "fetchy".to_string(),
            condition: binary(
                BinaryOperator::And,
                ExpressionNode::FetchRequest {
                    fetch_request_id: 7,
                },
                gt(sig(1), num(0.0)),
            ),
            signals: vec![f64_signal(1, 4, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        // 100 evaluations spread over 1500ms.
        for i in 0..100u64 {
            let t = i * 15;
            push(&mut e, 1, t, i as f64 + 1.0);
            e.evaluate_conditions(tp(t));
            while let (Some(_), _) = e.collect_next_data_to_send(tp(t)) {}
        }
        let mut ids = Vec::new();
        queue.consume_all(|id| ids.push(id));
        assert_eq!(ids, vec![7, 7]);
    }

    #[test]
    fn equality_uses_absolute_epsilon() {
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "eq".to_string(),
            condition: binary(BinaryOperator::Eq, sig(1), num(100.0)),
            signals: vec![f64_signal(1, 4, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        push(&mut e, 1, 1, 100.0009);
        assert!(e.evaluate_conditions(tp(1)));
        let (payload, _) = e.collect_next_data_to_send(tp(1));
        assert!(payload.is_some());

        push(&mut e, 1, 2, 100.1);
        assert!(!e.evaluate_conditions(tp(2)));
    }

    #[test]
    fn and_short_circuits_before_division_by_zero() {
        // false AND (1/0 > 0): the right side would error, but is never
        // evaluated.
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "short".to_string(),
            condition: binary(
                BinaryOperator::And,
                gt(sig(1), num(1e9)),
                gt(
                    binary(BinaryOperator::Div, num(1.0), num(0.0)),
                    num(0.0),
                ),
            ),
            signals: vec![f64_signal(1, 4, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();
        push(&mut e, 1, 1, 0.0);
        push(&mut e, 1, 2, 1.0);
        assert!(!e.evaluate_conditions(tp(2)));
        assert_eq!(e.metrics.eval_errors(), 0);

        // Force the right side: now the division error surfaces.
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "short2".to_string(),
            condition: binary(
                BinaryOperator::And,
                gt(sig(1), num(0.5)),
                gt(
                    binary(BinaryOperator::Div, num(1.0), num(0.0)),
                    num(0.0),
                ),
            ),
            signals: vec![f64_signal(1, 4, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(2)).unwrap();
        push(&mut e, 1, 3, 1.0);
        assert!(!e.evaluate_conditions(tp(3)));
        assert_eq!(e.metrics.eval_errors(), 1);
    }

    #[test]
    fn oversized_matrix_is_rejected_and_previous_stays() {
        let mut e = engine();
        let small = single_condition_matrix(ConditionSpec {
            scheme_id: "small".to_string(),
            condition: gt(sig(1), num(0.0)),
            signals: vec![f64_signal(1, 4, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(small, tp(0)).unwrap();

        // 1M f64 samples at 32 bytes each blow the 20MiB budget.
        let huge = single_condition_matrix(ConditionSpec {
            scheme_id: "huge".to_string(),
            condition: gt(sig(2), num(0.0)),
            signals: vec![f64_signal(2, 1_000_000, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        let error = e.on_change_inspection_matrix(huge, tp(1)).unwrap_err();
        assert!(matches!(error, EngineError::MatrixAllocationFailed { .. }));
        assert_eq!(e.metrics.matrix_swap_failures(), 1);

        // The previous matrix keeps working.
        push(&mut e, 1, 2, 5.0);
        assert!(e.evaluate_conditions(tp(2)));
    }

    #[test]
    fn too_many_conditions_are_rejected() {
        let mut e = engine();
        let conditions: Vec<ConditionSpec> = (0..MAX_ACTIVE_CONDITIONS + 1)
            .map(|i| ConditionSpec {
                scheme_id: format!("c{}", i),
                condition: ExpressionNode::Boolean { value: false },
                signals: vec![],
                trigger_only_on_rising_edge: false,
                is_static: true,
                after_duration_ms: 0,
                include_active_dtcs: false,
            })
            .collect();
        let error = e
            .on_change_inspection_matrix(Arc::new(InspectionMatrix { conditions }), tp(0))
            .unwrap_err();
        assert!(matches!(error, EngineError::TooManyConditions { .. }));
    }

    #[test]
    fn static_condition_triggers_at_apply_time() {
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "static".to_string(),
            condition: ExpressionNode::Boolean { value: true },
            signals: vec![f64_signal(1, 2, 0)],
            trigger_only_on_rising_edge: false,
            is_static: true,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(5)).unwrap();
        let (payload, _) = e.collect_next_data_to_send(tp(5));
        let payload = payload.unwrap();
        assert_eq!(payload.trigger_time_ms, BASE + 5);
        // No samples yet, but the event itself is reported.
        assert!(payload.signals.is_empty());
    }

    #[test]
    fn event_ids_embed_timestamp_and_counter() {
        let counter = AtomicU8::new(0);
        let a = generate_event_id(&counter, 0x0123_4567);
        let b = generate_event_id(&counter, 0x0123_4567);
        assert_eq!(a & 0x00FF_FFFF, 0x0023_4567);
        assert_eq!(a >> 24, 1);
        assert_eq!(b >> 24, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn after_duration_delays_collection() {
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "after".to_string(),
            condition: gt(sig(1), num(1.0)),
            signals: vec![f64_signal(1, 10, 0)],
            trigger_only_on_rising_edge: true,
            is_static: false,
            after_duration_ms: 100,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        push(&mut e, 1, 10, 2.0);
        e.evaluate_conditions(tp(10));
        // Too early: the post-trigger window is still open.
        let (payload, wait) = e.collect_next_data_to_send(tp(20));
        assert!(payload.is_none());
        assert_eq!(wait, 90);

        // A sample arriving inside the window is included in the payload.
        push(&mut e, 1, 60, 5.0);
        e.evaluate_conditions(tp(60));
        let (payload, _) = e.collect_next_data_to_send(tp(110));
        let payload = payload.unwrap();
        assert_eq!(payload.signals.len(), 2);
    }

    #[test]
    fn dtc_snapshot_attaches_once_per_update() {
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "dtc".to_string(),
            condition: gt(sig(1), num(0.0)),
            signals: vec![f64_signal(1, 4, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: true,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();
        e.set_active_dtcs(DtcInfo {
            receive_time_ms: BASE,
            active_codes: vec!["P0420".to_string()],
        });

        push(&mut e, 1, 1, 1.0);
        e.evaluate_conditions(tp(1));
        let (payload, _) = e.collect_next_data_to_send(tp(1));
        assert!(payload.unwrap().active_dtcs.is_some());

        // Same snapshot: not attached again.
        push(&mut e, 1, 2, 2.0);
        e.evaluate_conditions(tp(2));
        let (payload, _) = e.collect_next_data_to_send(tp(2));
        assert!(payload.unwrap().active_dtcs.is_none());

        // Fresh snapshot: attached once more.
        e.set_active_dtcs(DtcInfo {
            receive_time_ms: BASE + 3,
            active_codes: vec!["P0420".to_string(), "P0171".to_string()],
        });
        push(&mut e, 1, 3, 3.0);
        e.evaluate_conditions(tp(3));
        let (payload, _) = e.collect_next_data_to_send(tp(3));
        let dtcs = payload.unwrap().active_dtcs.unwrap();
        assert_eq!(dtcs.active_codes.len(), 2);
    }

    #[test]
    fn active_dtc_query_reflects_snapshot() {
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "dtcq".to_string(),
            condition: binary(
                BinaryOperator::And,
                ExpressionNode::ActiveDtcQuery,
                gt(sig(1), num(0.0)),
            ),
            signals: vec![f64_signal(1, 4, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        push(&mut e, 1, 1, 1.0);
        assert!(!e.evaluate_conditions(tp(1)));

        e.set_active_dtcs(DtcInfo {
            receive_time_ms: BASE,
            active_codes: vec!["U0100".to_string()],
        });
        push(&mut e, 1, 2, 2.0);
        assert!(e.evaluate_conditions(tp(2)));
    }

    struct Recording {
        seen: Mutex<Vec<(u64, Vec<InspectionValue>)>>,
        ends: Mutex<u32>,
        cleanups: Mutex<Vec<u64>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                ends: Mutex::new(0),
                cleanups: Mutex::new(Vec::new()),
            })
        }
    }

    impl CustomFunction for Recording {
        fn invoke(
            &self,
            invocation_id: u64,
            args: &[InspectionValue],
        ) -> Result<InspectionValue, ExpressionError> {
            self.seen
                .lock()
                .unwrap()
                .push((invocation_id, args.to_vec()));
            Ok(InspectionValue::Bool(true))
        }

        fn condition_end(
            &self,
            _collected_signal_ids: &HashSet<SignalId>,
            _timestamp_ms: u64,
            _payload: &mut TriggeredPayload,
        ) {
            *self.ends.lock().unwrap() += 1;
        }

        fn cleanup(&self, invocation_id: u64) {
            self.cleanups.lock().unwrap().push(invocation_id);
        }
    }

    fn custom_matrix(scheme_id: &str) -> Arc<InspectionMatrix> {
        single_condition_matrix(ConditionSpec {
            scheme_id: scheme_id.to_string(),
            condition: binary(
                BinaryOperator::And,
                ExpressionNode::Custom {
                    function_name: "record".to_string(),
                    args: vec![sig(1), ExpressionNode::Text {
                        value: "tag".to_string(),
                    }],
                },
                gt(sig(1), num(0.0)),
            ),
            signals: vec![f64_signal(1, 4, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        })
    }

    #[test]
    fn custom_functions_get_stable_invocations_and_lifecycle() {
        let recording = Recording::new();
        let mut e = engine();
        e.register_custom_function("record", recording.clone());

        e.on_change_inspection_matrix(custom_matrix("c"), tp(0)).unwrap();
        push(&mut e, 1, 1, 2.0);
        e.evaluate_conditions(tp(1));
        let first_invocation = {
            let seen = recording.seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(
                seen[0].1,
                vec![
                    InspectionValue::Number(2.0),
                    InspectionValue::Text("tag".to_string())
                ]
            );
            seen[0].0
        };
        let (payload, _) = e.collect_next_data_to_send(tp(1));
        assert!(payload.is_some());
        assert_eq!(*recording.ends.lock().unwrap(), 1);

        // Re-applying an identical matrix keeps the invocation id and does
        // not clean up.
        e.on_change_inspection_matrix(custom_matrix("c"), tp(2)).unwrap();
        push(&mut e, 1, 3, 2.0);
        e.evaluate_conditions(tp(3));
        assert_eq!(recording.seen.lock().unwrap()[1].0, first_invocation);
        assert!(recording.cleanups.lock().unwrap().is_empty());

        // A different scheme id retires the old node.
        e.on_change_inspection_matrix(custom_matrix("d"), tp(4)).unwrap();
        assert_eq!(*recording.cleanups.lock().unwrap(), vec![first_invocation]);
    }

    #[test]
    fn unknown_custom_function_counts_as_eval_error() {
        let mut e = engine();
        e.on_change_inspection_matrix(custom_matrix("c"), tp(0)).unwrap();
        push(&mut e, 1, 1, 2.0);
        assert!(!e.evaluate_conditions(tp(1)));
        assert_eq!(e.metrics.eval_errors(), 1);
    }

    #[test]
    fn is_new_goes_stale_after_collection() {
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "fresh".to_string(),
            condition: ExpressionNode::IsNew { signal_id: 1 },
            signals: vec![f64_signal(1, 4, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        push(&mut e, 1, 1, 1.0);
        assert!(e.evaluate_conditions(tp(1)));
        let (payload, _) = e.collect_next_data_to_send(tp(1));
        assert_eq!(payload.unwrap().signals.len(), 1);

        // The newest sample is consumed now; a same-value push does not make
        // it fresh again.
        push(&mut e, 1, 2, 1.0);
        assert!(!e.evaluate_conditions(tp(2)));
    }

    #[test]
    fn fetch_scoped_signals_stay_isolated() {
        let mut e = engine();
        let mut scoped = f64_signal(1, 4, 0);
        scoped.fetch_request_id = 9;
        let matrix = Arc::new(InspectionMatrix {
            conditions: vec![
                ConditionSpec {
                    scheme_id: "default-scope".to_string(),
                    condition: gt(sig(1), num(0.0)),
                    signals: vec![f64_signal(1, 4, 0)],
                    trigger_only_on_rising_edge: false,
                    is_static: false,
                    after_duration_ms: 0,
                    include_active_dtcs: false,
                },
                ConditionSpec {
                    scheme_id: "fetch-scope".to_string(),
                    condition: gt(sig(1), num(0.0)),
                    signals: vec![scoped],
                    trigger_only_on_rising_edge: false,
                    is_static: false,
                    after_duration_ms: 0,
                    include_active_dtcs: false,
                },
            ],
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        // A sample from fetch 9 only lands in the fetch-scoped buffer.
        e.add_new_signal(1, 9, tp(1), 1, SignalValue::Float64(5.0));
        e.evaluate_conditions(tp(1));
        let (payload, _) = e.collect_next_data_to_send(tp(1));
        let payload = payload.unwrap();
        assert_eq!(payload.scheme_id, "fetch-scope");
        assert_eq!(payload.signals.len(), 1);
        let (none, _) = e.collect_next_data_to_send(tp(1));
        assert!(none.is_none());
    }

    #[test]
    fn stack_overflow_guard_stops_deep_expressions() {
        let mut deep = sig(1);
        for _ in 0..(MAX_EVAL_DEPTH + 10) {
            deep = ExpressionNode::Not {
                operand: Box::new(ExpressionNode::Not {
                    operand: Box::new(deep),
                }),
            };
        }
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "deep".to_string(),
            condition: deep,
            signals: vec![f64_signal(1, 4, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();
        push(&mut e, 1, 1, 1.0);
        assert!(!e.evaluate_conditions(tp(1)));
        assert_eq!(e.metrics.eval_errors(), 1);
    }

    #[test]
    fn level_mode_retriggers_while_true() {
        let mut e = engine();
        let matrix = single_condition_matrix(ConditionSpec {
            scheme_id: "level".to_string(),
            condition: gt(sig(1), num(1.0)),
            signals: vec![f64_signal(1, 10, 0)],
            trigger_only_on_rising_edge: false,
            is_static: false,
            after_duration_ms: 0,
            include_active_dtcs: false,
        });
        e.on_change_inspection_matrix(matrix, tp(0)).unwrap();

        let mut payloads = 0;
        for (t, v) in [(1, 2.0), (2, 3.0), (3, 4.0)] {
            push(&mut e, 1, t, v);
            e.evaluate_conditions(tp(t));
            while let (Some(_), _) = e.collect_next_data_to_send(tp(t)) {
                payloads += 1;
            }
        }
        assert_eq!(payloads, 3);
    }
}
