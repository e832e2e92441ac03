//! Signal history buffers: typed ring buffers over incoming samples.
//!
//! Buffers are keyed by (buffer scope, signal id); the scope isolates
//! samples that were produced for different fetch requests. Each signal can
//! have several ring buffers, one per requested sampling interval, and each
//! ring carries the fixed-time windows computed over it.

use std::collections::HashMap;

use log::{debug, warn};

use vesper_common::{PayloadSignal, RawHandle, SignalId, SignalType, SignalValue, TimePoint};

use crate::inspection::window::{FixedTimeWindow, WindowValue};
use crate::rawbuf::{RawBufferManager, UsageStage};

/// Upper bound on concurrently active conditions; also the bitmap width.
pub const MAX_ACTIVE_CONDITIONS: usize = 128;

/// One bit per active condition.
pub type ConditionBitmap = u128;

pub fn condition_bit(index: usize) -> ConditionBitmap {
    1u128 << index
}

/// Scope index separating fetch-request-specific buffers; 0 is the shared
/// scope all regular bus traffic lands in.
pub type BufferScope = u32;

pub const DEFAULT_BUFFER_SCOPE: BufferScope = 0;

/// Value types a history ring can hold.
pub trait BufferValue: Copy + PartialEq + Default + std::fmt::Debug {
    /// True only for raw-data handles, which need use-count bookkeeping when
    /// slots are written and overwritten.
    const CONTAINS_HANDLES: bool = false;

    fn as_handle(self) -> Option<RawHandle> {
        None
    }
}

macro_rules! impl_buffer_value {
    ($($t:ty),*) => {
        $(impl BufferValue for $t {})*
    };
}

impl_buffer_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64, bool);

impl BufferValue for RawHandle {
    const CONTAINS_HANDLES: bool = true;

    fn as_handle(self) -> Option<RawHandle> {
        Some(self)
    }
}

/// String buffers never aggregate; this impl only satisfies the ring's
/// bound and is unreachable because windows are refused on string signals.
impl WindowValue for RawHandle {
    fn type_min() -> Self {
        RawHandle(0)
    }
    fn type_max() -> Self {
        RawHandle(u32::MAX)
    }
    fn to_f64(self) -> f64 {
        0.0
    }
    fn from_avg(_avg: f64) -> Self {
        RawHandle(0)
    }
}

/// One buffered sample plus its per-condition consumption state.
#[derive(Debug, Clone, Default)]
pub struct Sample<T> {
    pub value: T,
    /// Wall-clock receive time, carried into payloads.
    pub timestamp_ms: u64,
    consumed: ConditionBitmap,
}

impl<T> Sample<T> {
    pub fn is_consumed_by(&self, condition_idx: usize) -> bool {
        self.consumed & condition_bit(condition_idx) != 0
    }

    pub fn set_consumed(&mut self, condition_idx: usize) {
        self.consumed |= condition_bit(condition_idx);
    }
}

/// Bounded ring over the history of one signal at one sampling interval.
#[derive(Debug)]
pub struct SignalHistoryBuffer<T: BufferValue + WindowValue> {
    min_sample_interval_ms: u32,
    /// Required capacity: the max requested over all conditions using this
    /// signal at this interval.
    size: usize,
    ring: Vec<Sample<T>>,
    /// Index of the newest sample.
    head: usize,
    /// Total samples ever recorded.
    counter: u64,
    last_sample: TimePoint,
    pub subscribed_conditions: ConditionBitmap,
    windows: Vec<FixedTimeWindow<T>>,
}

impl<T: BufferValue + WindowValue> SignalHistoryBuffer<T> {
    pub fn new(size: usize, min_sample_interval_ms: u32) -> Self {
        Self {
            min_sample_interval_ms,
            size,
            ring: Vec::new(),
            head: 0,
            counter: 0,
            last_sample: TimePoint::default(),
            subscribed_conditions: 0,
            windows: Vec::new(),
        }
    }

    pub fn min_sample_interval_ms(&self) -> u32 {
        self.min_sample_interval_ms
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn grow_to(&mut self, size: usize) {
        self.size = self.size.max(size);
    }

    /// Register a window over this ring, deduplicating by length.
    pub fn add_window(&mut self, window_size_ms: u64) {
        if window_size_ms == 0 {
            return;
        }
        if self.get_window(window_size_ms).is_none() {
            self.windows.push(FixedTimeWindow::new(window_size_ms));
        }
    }

    pub fn get_window(&self, window_size_ms: u64) -> Option<&FixedTimeWindow<T>> {
        self.windows
            .iter()
            .find(|w| w.window_size_ms() == window_size_ms)
    }

    /// Reserve the ring storage. Called once when a matrix is applied.
    pub fn allocate(&mut self) {
        self.ring = vec![Sample::default(); self.size];
        self.head = self.size.saturating_sub(1);
    }

    fn is_allocated(&self) -> bool {
        self.size > 0 && self.size <= self.ring.len()
    }

    /// Subsampling gate: interval 0 accepts everything, the first sample
    /// always passes, otherwise the monotonic gap must have elapsed.
    fn accepts(&self, receive_time: TimePoint) -> bool {
        self.min_sample_interval_ms == 0
            || (self.last_sample.system_time_ms == 0 && self.last_sample.monotonic_time_ms == 0)
            || receive_time.monotonic_time_ms
                >= self.last_sample.monotonic_time_ms + u64::from(self.min_sample_interval_ms)
    }

    /// Overwrite the oldest slot with a new sample, update windows, and
    /// report whether conditions subscribed to this buffer must re-evaluate.
    fn insert(
        &mut self,
        signal_id: SignalId,
        value: T,
        receive_time: TimePoint,
        monotonic_now_ms: u64,
        raw_buffer_manager: Option<&RawBufferManager>,
        next_window_times_out: &mut u64,
    ) -> bool {
        let old_value = self.ring[self.head].value;
        self.head += 1;
        if self.head >= self.size {
            self.head = 0;
        }
        if T::CONTAINS_HANDLES && self.counter >= self.size as u64 {
            // Release the sample this insert overwrites.
            if let (Some(manager), Some(handle)) =
                (raw_buffer_manager, self.ring[self.head].value.as_handle())
            {
                manager.decrease_usage(signal_id, handle, UsageStage::HistoryBuffer);
            }
        }
        self.ring[self.head] = Sample {
            value,
            timestamp_ms: receive_time.system_time_ms,
            consumed: 0,
        };
        self.counter += 1;
        self.last_sample = receive_time;

        let mut input_changed = false;
        for window in &mut self.windows {
            if window.add_value(value, monotonic_now_ms, next_window_times_out) {
                input_changed = true;
            }
        }
        if old_value != value {
            input_changed = true;
        }
        if T::CONTAINS_HANDLES {
            if let (Some(manager), Some(handle)) = (raw_buffer_manager, value.as_handle()) {
                manager.increase_usage(signal_id, handle, UsageStage::HistoryBuffer);
            }
        }
        input_changed
    }

    /// Samples currently held, at most `size`.
    pub fn len(&self) -> usize {
        (self.counter.min(self.size as u64)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.counter == 0
    }

    fn nth_newest_index(&self, n: usize) -> usize {
        (self.head + self.size - n) % self.size
    }

    /// The n-th newest sample; n = 0 is the most recent.
    pub fn nth_newest(&self, n: usize) -> Option<&Sample<T>> {
        if n >= self.len() {
            return None;
        }
        let idx = self.nth_newest_index(n);
        Some(&self.ring[idx])
    }

    pub fn nth_newest_mut(&mut self, n: usize) -> Option<&mut Sample<T>> {
        if n >= self.len() {
            return None;
        }
        let idx = self.nth_newest_index(n);
        Some(&mut self.ring[idx])
    }

    pub fn newest(&self) -> Option<&Sample<T>> {
        self.nth_newest(0)
    }

    /// Newest-first iterator over the held samples.
    pub fn newest_iter(&self) -> impl Iterator<Item = &Sample<T>> {
        (0..self.len()).filter_map(move |n| self.nth_newest(n))
    }

    /// Advance all windows on time passage. Returns true when any window
    /// recomputed.
    pub fn advance_windows(&mut self, monotonic_now_ms: u64, next_window_times_out: &mut u64) -> bool {
        let mut changed = false;
        for window in &mut self.windows {
            if window.advance(monotonic_now_ms, next_window_times_out) {
                changed = true;
            }
        }
        changed
    }

    /// Release every handle still held by this ring. Called when the buffer
    /// is retired on a matrix swap.
    pub fn release_handles(&self, signal_id: SignalId, raw_buffer_manager: &RawBufferManager) {
        if !T::CONTAINS_HANDLES {
            return;
        }
        for sample in self.newest_iter() {
            if let Some(handle) = sample.value.as_handle() {
                raw_buffer_manager.decrease_usage(signal_id, handle, UsageStage::HistoryBuffer);
            }
        }
    }
}

/// Availability-aware read of one window aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowRead {
    /// No window of that length exists over the buffer.
    NoWindow,
    /// The window exists but has not completed yet.
    NotAvailable,
    Value(f64),
}

/// Which aggregate of which completed window an expression reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFunction {
    LastMin,
    LastMax,
    LastAvg,
    PreviousMin,
    PreviousMax,
    PreviousAvg,
}

/// All sampling-interval variants of one signal in one scope, specialized by
/// the signal's data type.
#[derive(Debug)]
pub enum TypedBuffers {
    Uint8(Vec<SignalHistoryBuffer<u8>>),
    Int8(Vec<SignalHistoryBuffer<i8>>),
    Uint16(Vec<SignalHistoryBuffer<u16>>),
    Int16(Vec<SignalHistoryBuffer<i16>>),
    Uint32(Vec<SignalHistoryBuffer<u32>>),
    Int32(Vec<SignalHistoryBuffer<i32>>),
    Uint64(Vec<SignalHistoryBuffer<u64>>),
    Int64(Vec<SignalHistoryBuffer<i64>>),
    Float32(Vec<SignalHistoryBuffer<f32>>),
    Float64(Vec<SignalHistoryBuffer<f64>>),
    Bool(Vec<SignalHistoryBuffer<bool>>),
    String(Vec<SignalHistoryBuffer<RawHandle>>),
}

/// Run `$body` with `$vec` bound to the typed buffer vector, whatever the
/// variant.
macro_rules! with_buffers {
    ($buffers:expr, |$vec:ident| $body:expr) => {
        match $buffers {
            TypedBuffers::Uint8($vec) => $body,
            TypedBuffers::Int8($vec) => $body,
            TypedBuffers::Uint16($vec) => $body,
            TypedBuffers::Int16($vec) => $body,
            TypedBuffers::Uint32($vec) => $body,
            TypedBuffers::Int32($vec) => $body,
            TypedBuffers::Uint64($vec) => $body,
            TypedBuffers::Int64($vec) => $body,
            TypedBuffers::Float32($vec) => $body,
            TypedBuffers::Float64($vec) => $body,
            TypedBuffers::Bool($vec) => $body,
            TypedBuffers::String($vec) => $body,
        }
    };
}

/// Pair a typed buffer vector with a matching typed sample value, or run the
/// mismatch arm when the sample's type does not match the buffer's.
macro_rules! with_matching_value {
    ($buffers:expr, $value:expr, |$vec:ident, $v:ident| $body:expr, $mismatch:expr) => {
        match ($buffers, $value) {
            (TypedBuffers::Uint8($vec), SignalValue::Uint8($v)) => $body,
            (TypedBuffers::Int8($vec), SignalValue::Int8($v)) => $body,
            (TypedBuffers::Uint16($vec), SignalValue::Uint16($v)) => $body,
            (TypedBuffers::Int16($vec), SignalValue::Int16($v)) => $body,
            (TypedBuffers::Uint32($vec), SignalValue::Uint32($v)) => $body,
            (TypedBuffers::Int32($vec), SignalValue::Int32($v)) => $body,
            (TypedBuffers::Uint64($vec), SignalValue::Uint64($v)) => $body,
            (TypedBuffers::Int64($vec), SignalValue::Int64($v)) => $body,
            (TypedBuffers::Float32($vec), SignalValue::Float32($v)) => $body,
            (TypedBuffers::Float64($vec), SignalValue::Float64($v)) => $body,
            (TypedBuffers::Bool($vec), SignalValue::Bool($v)) => $body,
            (TypedBuffers::String($vec), SignalValue::RawHandle($v)) => $body,
            _ => $mismatch,
        }
    };
}

impl TypedBuffers {
    pub fn for_type(signal_type: SignalType) -> Self {
        match signal_type {
            SignalType::Uint8 => TypedBuffers::Uint8(Vec::new()),
            SignalType::Int8 => TypedBuffers::Int8(Vec::new()),
            SignalType::Uint16 => TypedBuffers::Uint16(Vec::new()),
            SignalType::Int16 => TypedBuffers::Int16(Vec::new()),
            SignalType::Uint32 => TypedBuffers::Uint32(Vec::new()),
            SignalType::Int32 => TypedBuffers::Int32(Vec::new()),
            SignalType::Uint64 => TypedBuffers::Uint64(Vec::new()),
            SignalType::Int64 => TypedBuffers::Int64(Vec::new()),
            SignalType::Float32 => TypedBuffers::Float32(Vec::new()),
            SignalType::Float64 => TypedBuffers::Float64(Vec::new()),
            SignalType::Bool => TypedBuffers::Bool(Vec::new()),
            SignalType::String => TypedBuffers::String(Vec::new()),
        }
    }

    pub fn signal_type(&self) -> SignalType {
        match self {
            TypedBuffers::Uint8(_) => SignalType::Uint8,
            TypedBuffers::Int8(_) => SignalType::Int8,
            TypedBuffers::Uint16(_) => SignalType::Uint16,
            TypedBuffers::Int16(_) => SignalType::Int16,
            TypedBuffers::Uint32(_) => SignalType::Uint32,
            TypedBuffers::Int32(_) => SignalType::Int32,
            TypedBuffers::Uint64(_) => SignalType::Uint64,
            TypedBuffers::Int64(_) => SignalType::Int64,
            TypedBuffers::Float32(_) => SignalType::Float32,
            TypedBuffers::Float64(_) => SignalType::Float64,
            TypedBuffers::Bool(_) => SignalType::Bool,
            TypedBuffers::String(_) => SignalType::String,
        }
    }

    /// Find or create the ring for one sampling interval and make sure its
    /// capacity covers `size`.
    pub fn ensure_variant(&mut self, size: usize, interval_ms: u32, window_size_ms: u64) {
        if window_size_ms != 0 && self.signal_type() == SignalType::String {
            debug!("ignoring window request over a string signal");
        }
        let is_string = self.signal_type() == SignalType::String;
        with_buffers!(self, |vec| {
            if let Some(buffer) = vec
                .iter_mut()
                .find(|b| b.min_sample_interval_ms() == interval_ms)
            {
                buffer.grow_to(size);
                if !is_string {
                    buffer.add_window(window_size_ms);
                }
            } else {
                let mut buffer = SignalHistoryBuffer::new(size, interval_ms);
                if !is_string {
                    buffer.add_window(window_size_ms);
                }
                vec.push(buffer);
            }
        })
    }

    pub fn subscribe_condition(&mut self, interval_ms: u32, condition_idx: usize) {
        with_buffers!(self, |vec| {
            if let Some(buffer) = vec
                .iter_mut()
                .find(|b| b.min_sample_interval_ms() == interval_ms)
            {
                buffer.subscribed_conditions |= condition_bit(condition_idx);
            }
        })
    }

    pub fn allocate(&mut self) {
        with_buffers!(self, |vec| {
            for buffer in vec.iter_mut() {
                buffer.allocate();
            }
        })
    }

    /// Bytes this signal's rings occupy, using the nominal per-sample cost.
    pub fn sample_bytes(&self) -> usize {
        let per_sample = self.signal_type().sample_size_bytes();
        with_buffers!(self, |vec| vec
            .iter()
            .map(|b| b.size() * per_sample)
            .sum::<usize>())
    }

    /// Route one sample into every interval variant whose gate passes.
    /// Returns the union of subscribed-condition bitmaps that must
    /// re-evaluate, or None when the value type does not match the buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_sample(
        &mut self,
        signal_id: SignalId,
        value: SignalValue,
        receive_time: TimePoint,
        monotonic_now_ms: u64,
        raw_buffer_manager: Option<&RawBufferManager>,
        next_window_times_out: &mut u64,
    ) -> Option<ConditionBitmap> {
        let buffer_type = self.signal_type();
        with_matching_value!(
            self,
            value,
            |vec, v| {
                let mut dirty: ConditionBitmap = 0;
                for buffer in vec.iter_mut() {
                    if buffer.is_allocated()
                        && buffer.accepts(receive_time)
                        && buffer.insert(
                            signal_id,
                            v,
                            receive_time,
                            monotonic_now_ms,
                            raw_buffer_manager,
                            next_window_times_out,
                        )
                    {
                        dirty |= buffer.subscribed_conditions;
                    }
                }
                Some(dirty)
            },
            {
                warn!(
                    "sample for signal {} has type {:?} but the buffer holds {:?}",
                    signal_id,
                    value.signal_type(),
                    buffer_type
                );
                None
            }
        )
    }

    /// Newest sample of the ring at `interval_ms`, as a type-erased value
    /// plus its receive timestamp and whether `condition_idx` consumed it.
    pub fn newest_value(
        &self,
        interval_ms: u32,
        condition_idx: usize,
    ) -> Option<(SignalValue, u64, bool)> {
        macro_rules! read {
            ($vec:ident, $ctor:ident) => {
                $vec.iter()
                    .find(|b| b.min_sample_interval_ms() == interval_ms)
                    .and_then(|b| b.newest())
                    .map(|s| {
                        (
                            SignalValue::$ctor(s.value),
                            s.timestamp_ms,
                            s.is_consumed_by(condition_idx),
                        )
                    })
            };
        }
        match self {
            TypedBuffers::Uint8(vec) => read!(vec, Uint8),
            TypedBuffers::Int8(vec) => read!(vec, Int8),
            TypedBuffers::Uint16(vec) => read!(vec, Uint16),
            TypedBuffers::Int16(vec) => read!(vec, Int16),
            TypedBuffers::Uint32(vec) => read!(vec, Uint32),
            TypedBuffers::Int32(vec) => read!(vec, Int32),
            TypedBuffers::Uint64(vec) => read!(vec, Uint64),
            TypedBuffers::Int64(vec) => read!(vec, Int64),
            TypedBuffers::Float32(vec) => read!(vec, Float32),
            TypedBuffers::Float64(vec) => read!(vec, Float64),
            TypedBuffers::Bool(vec) => read!(vec, Bool),
            TypedBuffers::String(vec) => read!(vec, RawHandle),
        }
    }

    /// Read one aggregate of the window `window_size_ms` over the ring at
    /// `interval_ms`. Averages keep the sample type's truncation.
    pub fn window_value(
        &self,
        interval_ms: u32,
        window_size_ms: u64,
        function: WindowFunction,
    ) -> WindowRead {
        if matches!(self, TypedBuffers::String(_)) {
            return WindowRead::NoWindow;
        }
        with_buffers!(self, |vec| {
            let Some(window) = vec
                .iter()
                .find(|b| b.min_sample_interval_ms() == interval_ms)
                .and_then(|b| b.get_window(window_size_ms))
            else {
                return WindowRead::NoWindow;
            };
            let stats = match function {
                WindowFunction::LastMin | WindowFunction::LastMax | WindowFunction::LastAvg => {
                    window.last()
                }
                _ => window.previous(),
            };
            match stats {
                None => WindowRead::NotAvailable,
                Some(stats) => WindowRead::Value(match function {
                    WindowFunction::LastMin | WindowFunction::PreviousMin => stats.min.to_f64(),
                    WindowFunction::LastMax | WindowFunction::PreviousMax => stats.max.to_f64(),
                    WindowFunction::LastAvg | WindowFunction::PreviousAvg => stats.avg.to_f64(),
                }),
            }
        })
    }

    /// Copy up to `max_count` newest samples into `out`, skipping samples
    /// this condition already consumed and, in send-once mode, samples not
    /// newer than `published_before_ms`. Collected samples are marked
    /// consumed; handles get a selected-for-upload use count.
    #[allow(clippy::too_many_arguments)]
    pub fn collect_newest(
        &mut self,
        signal_id: SignalId,
        interval_ms: u32,
        max_count: usize,
        condition_idx: usize,
        published_before_ms: Option<u64>,
        raw_buffer_manager: Option<&RawBufferManager>,
        newest_timestamp_ms: &mut u64,
        out: &mut Vec<PayloadSignal>,
    ) {
        macro_rules! collect {
            ($vec:ident, $ctor:ident) => {{
                let Some(buffer) = $vec
                    .iter_mut()
                    .find(|b| b.min_sample_interval_ms() == interval_ms)
                else {
                    return;
                };
                let available = buffer.len().min(max_count);
                for n in 0..available {
                    let sample = buffer.nth_newest_mut(n).unwrap();
                    if let Some(published) = published_before_ms {
                        // Older samples only get older from here.
                        if sample.timestamp_ms <= published {
                            break;
                        }
                    }
                    if sample.is_consumed_by(condition_idx) {
                        continue;
                    }
                    sample.set_consumed(condition_idx);
                    let value = SignalValue::$ctor(sample.value);
                    if *newest_timestamp_ms < sample.timestamp_ms {
                        *newest_timestamp_ms = sample.timestamp_ms;
                    }
                    if let (Some(manager), SignalValue::RawHandle(handle)) =
                        (raw_buffer_manager, value)
                    {
                        manager.increase_usage(signal_id, handle, UsageStage::SelectedForUpload);
                    }
                    out.push(PayloadSignal {
                        signal_id,
                        timestamp_ms: sample.timestamp_ms,
                        value,
                        signal_type: value.signal_type(),
                    });
                }
            }};
        }
        match self {
            TypedBuffers::Uint8(vec) => collect!(vec, Uint8),
            TypedBuffers::Int8(vec) => collect!(vec, Int8),
            TypedBuffers::Uint16(vec) => collect!(vec, Uint16),
            TypedBuffers::Int16(vec) => collect!(vec, Int16),
            TypedBuffers::Uint32(vec) => collect!(vec, Uint32),
            TypedBuffers::Int32(vec) => collect!(vec, Int32),
            TypedBuffers::Uint64(vec) => collect!(vec, Uint64),
            TypedBuffers::Int64(vec) => collect!(vec, Int64),
            TypedBuffers::Float32(vec) => collect!(vec, Float32),
            TypedBuffers::Float64(vec) => collect!(vec, Float64),
            TypedBuffers::Bool(vec) => collect!(vec, Bool),
            TypedBuffers::String(vec) => collect!(vec, RawHandle),
        }
    }

    /// Advance every window of every interval variant on time passage.
    /// Returns the union of subscribed-condition bitmaps that must
    /// re-evaluate.
    pub fn advance_windows(
        &mut self,
        monotonic_now_ms: u64,
        next_window_times_out: &mut u64,
    ) -> ConditionBitmap {
        with_buffers!(self, |vec| {
            let mut dirty: ConditionBitmap = 0;
            for buffer in vec.iter_mut() {
                if buffer.advance_windows(monotonic_now_ms, next_window_times_out) {
                    dirty |= buffer.subscribed_conditions;
                }
            }
            dirty
        })
    }

    /// Release history-buffer use counts on every held handle.
    pub fn release_handles(&self, signal_id: SignalId, raw_buffer_manager: &RawBufferManager) {
        if let TypedBuffers::String(vec) = self {
            for buffer in vec {
                buffer.release_handles(signal_id, raw_buffer_manager);
            }
        }
    }

    /// Number of samples in the ring at `interval_ms`.
    pub fn sample_count(&self, interval_ms: u32) -> usize {
        with_buffers!(self, |vec| vec
            .iter()
            .find(|b| b.min_sample_interval_ms() == interval_ms)
            .map(|b| b.len())
            .unwrap_or(0))
    }
}

/// All history buffers of the active inspection matrix.
#[derive(Debug, Default)]
pub struct SignalBufferStore {
    buffers: HashMap<BufferScope, HashMap<SignalId, TypedBuffers>>,
    signal_types: HashMap<SignalId, SignalType>,
}

impl SignalBufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or extend the buffer for one (scope, signal, interval). Fails
    /// when the signal was registered before with a different type.
    pub fn ensure_buffer(
        &mut self,
        scope: BufferScope,
        signal_id: SignalId,
        signal_type: SignalType,
        size: usize,
        interval_ms: u32,
        window_size_ms: u64,
    ) -> bool {
        match self.signal_types.get(&signal_id) {
            Some(existing) if *existing != signal_type => {
                warn!(
                    "signal {} requested as {:?} but already registered as {:?}",
                    signal_id, signal_type, existing
                );
                return false;
            }
            _ => {
                self.signal_types.insert(signal_id, signal_type);
            }
        }
        let typed = self
            .buffers
            .entry(scope)
            .or_default()
            .entry(signal_id)
            .or_insert_with(|| TypedBuffers::for_type(signal_type));
        typed.ensure_variant(size, interval_ms, window_size_ms);
        true
    }

    pub fn subscribe_condition(
        &mut self,
        scope: BufferScope,
        signal_id: SignalId,
        interval_ms: u32,
        condition_idx: usize,
    ) {
        if let Some(typed) = self
            .buffers
            .get_mut(&scope)
            .and_then(|signals| signals.get_mut(&signal_id))
        {
            typed.subscribe_condition(interval_ms, condition_idx);
        }
    }

    /// Total bytes the rings will occupy once allocated.
    pub fn total_sample_bytes(&self) -> usize {
        self.buffers
            .values()
            .flat_map(|signals| signals.values())
            .map(|typed| typed.sample_bytes())
            .sum()
    }

    pub fn allocate_all(&mut self) {
        for signals in self.buffers.values_mut() {
            for typed in signals.values_mut() {
                typed.allocate();
            }
        }
    }

    pub fn signal_type(&self, signal_id: SignalId) -> Option<SignalType> {
        self.signal_types.get(&signal_id).copied()
    }

    pub fn get(&self, scope: BufferScope, signal_id: SignalId) -> Option<&TypedBuffers> {
        self.buffers.get(&scope)?.get(&signal_id)
    }

    pub fn get_mut(&mut self, scope: BufferScope, signal_id: SignalId) -> Option<&mut TypedBuffers> {
        self.buffers.get_mut(&scope)?.get_mut(&signal_id)
    }

    /// Route one incoming sample into the buffers of its scope. Returns the
    /// bitmap of conditions whose input changed (empty when the signal is
    /// not observed by the active matrix).
    pub fn insert_sample(
        &mut self,
        scope: BufferScope,
        signal: SignalId,
        value: SignalValue,
        receive_time: TimePoint,
        monotonic_now_ms: u64,
        raw_buffer_manager: Option<&RawBufferManager>,
        next_window_times_out: &mut u64,
    ) -> ConditionBitmap {
        let Some(typed) = self
            .buffers
            .get_mut(&scope)
            .and_then(|signals| signals.get_mut(&signal))
        else {
            // Signal not collected by any active condition.
            return 0;
        };
        typed
            .insert_sample(
                signal,
                value,
                receive_time,
                monotonic_now_ms,
                raw_buffer_manager,
                next_window_times_out,
            )
            .unwrap_or(0)
    }

    /// Advance every window in the store on time passage. Returns the
    /// bitmap of conditions whose window inputs changed.
    pub fn advance_all_windows(
        &mut self,
        monotonic_now_ms: u64,
        next_window_times_out: &mut u64,
    ) -> ConditionBitmap {
        let mut dirty: ConditionBitmap = 0;
        for signals in self.buffers.values_mut() {
            for typed in signals.values_mut() {
                dirty |= typed.advance_windows(monotonic_now_ms, next_window_times_out);
            }
        }
        dirty
    }

    /// Release all raw handles held by any string buffer; used when the
    /// store is retired on a matrix swap.
    pub fn release_all_handles(&self, raw_buffer_manager: &RawBufferManager) {
        for signals in self.buffers.values() {
            for (signal_id, typed) in signals {
                typed.release_handles(*signal_id, raw_buffer_manager);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(system: u64, monotonic: u64) -> TimePoint {
        TimePoint::new(system, monotonic)
    }

    const BASE: u64 = 1_700_000_000_000;

    #[test]
    fn ring_keeps_newest_samples() {
        let mut buffer = SignalHistoryBuffer::<f64>::new(3, 0);
        buffer.allocate();
        let mut timeout = u64::MAX;
        for (i, v) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            buffer.insert(1, *v, tp(BASE + i as u64, i as u64), i as u64, None, &mut timeout);
        }
        assert_eq!(buffer.len(), 3);
        let newest: Vec<f64> = buffer.newest_iter().map(|s| s.value).collect();
        assert_eq!(newest, vec![4.0, 3.0, 2.0]);
    }

    #[test]
    fn subsampling_gate_follows_min_interval() {
        let mut buffer = SignalHistoryBuffer::<f64>::new(4, 10);
        buffer.allocate();
        // First sample always passes.
        assert!(buffer.accepts(tp(BASE, 0)));
        let mut timeout = u64::MAX;
        buffer.insert(1, 1.0, tp(BASE, 0), 0, None, &mut timeout);
        // 5ms later: below the interval.
        assert!(!buffer.accepts(tp(BASE + 5, 5)));
        // Exactly the interval: the tie-break is >=, not >.
        assert!(buffer.accepts(tp(BASE + 10, 10)));
        buffer.insert(1, 2.0, tp(BASE + 10, 10), 10, None, &mut timeout);
        assert!(buffer.accepts(tp(BASE + 20, 20)));
    }

    #[test]
    fn zero_interval_accepts_every_sample() {
        let buffer = SignalHistoryBuffer::<u32>::new(2, 0);
        assert!(buffer.accepts(tp(BASE, 0)));
        assert!(buffer.accepts(tp(BASE, 0)));
    }

    #[test]
    fn insert_reports_dirty_on_value_change_only() {
        let mut buffer = SignalHistoryBuffer::<i32>::new(4, 0);
        buffer.subscribed_conditions = condition_bit(2);
        buffer.allocate();
        let mut timeout = u64::MAX;
        assert!(buffer.insert(1, 5, tp(BASE, 0), 0, None, &mut timeout));
        // Same value again, no windows: nothing to re-evaluate.
        assert!(!buffer.insert(1, 5, tp(BASE + 1, 1), 1, None, &mut timeout));
        assert!(buffer.insert(1, 6, tp(BASE + 2, 2), 2, None, &mut timeout));
    }

    #[test]
    fn windows_mark_dirty_on_recompute() {
        let mut buffer = SignalHistoryBuffer::<i32>::new(4, 0);
        buffer.add_window(100);
        buffer.allocate();
        let mut timeout = u64::MAX;
        // Bootstrap counts as a window change.
        assert!(buffer.insert(1, 5, tp(BASE, 0), 0, None, &mut timeout));
        assert!(!buffer.insert(1, 5, tp(BASE + 10, 10), 10, None, &mut timeout));
        // Crossing the boundary recomputes the window even though the raw
        // value is unchanged.
        assert!(buffer.insert(1, 5, tp(BASE + 120, 120), 120, None, &mut timeout));
    }

    #[test]
    fn store_routes_by_scope_and_type() {
        let mut store = SignalBufferStore::new();
        assert!(store.ensure_buffer(0, 1, SignalType::Float64, 4, 0, 0));
        assert!(store.ensure_buffer(7, 1, SignalType::Float64, 2, 0, 0));
        store.allocate_all();

        let mut timeout = u64::MAX;
        store.insert_sample(0, 1, SignalValue::Float64(1.0), tp(BASE, 0), 0, None, &mut timeout);
        store.insert_sample(7, 1, SignalValue::Float64(2.0), tp(BASE, 0), 0, None, &mut timeout);

        assert_eq!(store.get(0, 1).unwrap().sample_count(0), 1);
        assert_eq!(store.get(7, 1).unwrap().sample_count(0), 1);
        let (value, _, _) = store.get(7, 1).unwrap().newest_value(0, 0).unwrap();
        assert_eq!(value, SignalValue::Float64(2.0));
    }

    #[test]
    fn store_rejects_conflicting_types() {
        let mut store = SignalBufferStore::new();
        assert!(store.ensure_buffer(0, 1, SignalType::Float64, 4, 0, 0));
        assert!(!store.ensure_buffer(0, 1, SignalType::Int32, 4, 0, 0));
    }

    #[test]
    fn mismatched_sample_type_is_discarded() {
        let mut store = SignalBufferStore::new();
        store.ensure_buffer(0, 1, SignalType::Float64, 4, 0, 0);
        store.allocate_all();
        let mut timeout = u64::MAX;
        let dirty = store.insert_sample(
            0,
            1,
            SignalValue::Int32(5),
            tp(BASE, 0),
            0,
            None,
            &mut timeout,
        );
        assert_eq!(dirty, 0);
        assert_eq!(store.get(0, 1).unwrap().sample_count(0), 0);
    }

    #[test]
    fn capacity_is_max_over_requests() {
        let mut store = SignalBufferStore::new();
        store.ensure_buffer(0, 1, SignalType::Float64, 4, 0, 0);
        store.ensure_buffer(0, 1, SignalType::Float64, 10, 0, 0);
        store.ensure_buffer(0, 1, SignalType::Float64, 2, 0, 0);
        // One shared ring sized for the largest request, 32 bytes/sample.
        assert_eq!(store.total_sample_bytes(), 10 * 32);
    }

    #[test]
    fn handle_refcounts_follow_overwrites() {
        use crate::config::RawBufConfig;
        use bytes::Bytes;

        let manager = RawBufferManager::new(&RawBufConfig::default());
        let h1 = manager.push(9, Bytes::from_static(b"one"), 0);
        let h2 = manager.push(9, Bytes::from_static(b"two"), 1);
        let h3 = manager.push(9, Bytes::from_static(b"three"), 2);

        let mut buffer = SignalHistoryBuffer::<RawHandle>::new(2, 0);
        buffer.allocate();
        let mut timeout = u64::MAX;
        buffer.insert(9, h1, tp(BASE, 0), 0, Some(&manager), &mut timeout);
        buffer.insert(9, h2, tp(BASE + 1, 1), 1, Some(&manager), &mut timeout);
        assert_eq!(manager.usage_count(9, h1, UsageStage::HistoryBuffer), 1);
        assert_eq!(manager.usage_count(9, h2, UsageStage::HistoryBuffer), 1);

        // Capacity 2: the third insert overwrites h1 and releases it.
        buffer.insert(9, h3, tp(BASE + 2, 2), 2, Some(&manager), &mut timeout);
        assert_eq!(manager.usage_count(9, h1, UsageStage::HistoryBuffer), 0);
        assert_eq!(manager.usage_count(9, h2, UsageStage::HistoryBuffer), 1);
        assert_eq!(manager.usage_count(9, h3, UsageStage::HistoryBuffer), 1);

        let held: Vec<RawHandle> = buffer.newest_iter().map(|s| s.value).collect();
        assert_eq!(held, vec![h3, h2]);

        buffer.release_handles(9, &manager);
        assert_eq!(manager.usage_count(9, h2, UsageStage::HistoryBuffer), 0);
        assert_eq!(manager.usage_count(9, h3, UsageStage::HistoryBuffer), 0);
    }

    #[test]
    fn collect_newest_filters_consumed_and_published() {
        let mut store = SignalBufferStore::new();
        store.ensure_buffer(0, 1, SignalType::Float64, 4, 0, 0);
        store.allocate_all();
        let mut timeout = u64::MAX;
        for i in 0..4u64 {
            store.insert_sample(
                0,
                1,
                SignalValue::Float64(i as f64),
                tp(BASE + i, i),
                i,
                None,
                &mut timeout,
            );
        }

        let typed = store.get_mut(0, 1).unwrap();
        let mut newest_ts = 0;
        let mut out = Vec::new();
        typed.collect_newest(1, 0, 10, 3, None, None, &mut newest_ts, &mut out);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].value, SignalValue::Float64(3.0));
        assert_eq!(newest_ts, BASE + 3);

        // Everything is now consumed for condition 3; nothing new to emit.
        let mut out2 = Vec::new();
        typed.collect_newest(1, 0, 10, 3, None, None, &mut newest_ts, &mut out2);
        assert!(out2.is_empty());

        // Another condition still sees the samples, but the published
        // cutoff hides everything at or before BASE + 2.
        let mut out3 = Vec::new();
        typed.collect_newest(1, 0, 10, 4, Some(BASE + 2), None, &mut newest_ts, &mut out3);
        assert_eq!(out3.len(), 1);
        assert_eq!(out3[0].value, SignalValue::Float64(3.0));
    }

    #[test]
    fn window_reads_distinguish_missing_and_pending() {
        let mut store = SignalBufferStore::new();
        store.ensure_buffer(0, 1, SignalType::Int32, 4, 0, 1000);
        store.allocate_all();
        let typed = store.get_mut(0, 1).unwrap();
        assert_eq!(
            typed.window_value(0, 500, WindowFunction::LastMin),
            WindowRead::NoWindow
        );
        assert_eq!(
            typed.window_value(0, 1000, WindowFunction::LastMin),
            WindowRead::NotAvailable
        );
        let mut timeout = u64::MAX;
        typed.insert_sample(1, SignalValue::Int32(5), tp(BASE, 0), 0, None, &mut timeout);
        typed.insert_sample(1, SignalValue::Int32(9), tp(BASE, 1100), 1100, None, &mut timeout);
        assert_eq!(
            typed.window_value(0, 1000, WindowFunction::LastMin),
            WindowRead::Value(5.0)
        );
        assert_eq!(
            typed.window_value(0, 1000, WindowFunction::PreviousMin),
            WindowRead::NotAvailable
        );
    }
}
