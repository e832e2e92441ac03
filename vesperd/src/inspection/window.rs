//! Fixed-time window statistics over signal samples.
//!
//! All values are maintained with an online algorithm: every new sample
//! updates the running min/max/sum, and window boundaries are wall-clock
//! based, not sample based. The last two completed windows are kept so
//! expressions can reference both the most recent completed window and the
//! one before it.

/// Sample types a window can aggregate.
pub trait WindowValue: Copy + PartialOrd {
    /// Smallest representable value, used as the max-tracking seed.
    fn type_min() -> Self;
    /// Largest representable value, used as the min-tracking seed.
    fn type_max() -> Self;
    fn to_f64(self) -> f64;
    /// Cast an f64 average back to the sample type. Integer types truncate
    /// toward zero.
    fn from_avg(avg: f64) -> Self;
}

macro_rules! impl_window_value_int {
    ($($t:ty),*) => {
        $(
            impl WindowValue for $t {
                fn type_min() -> Self {
                    <$t>::MIN
                }
                fn type_max() -> Self {
                    <$t>::MAX
                }
                fn to_f64(self) -> f64 {
                    self as f64
                }
                fn from_avg(avg: f64) -> Self {
                    avg as $t
                }
            }
        )*
    };
}

impl_window_value_int!(u8, i8, u16, i16, u32, i32, u64, i64);

macro_rules! impl_window_value_float {
    ($($t:ty),*) => {
        $(
            impl WindowValue for $t {
                fn type_min() -> Self {
                    <$t>::MIN
                }
                fn type_max() -> Self {
                    <$t>::MAX
                }
                fn to_f64(self) -> f64 {
                    self as f64
                }
                fn from_avg(avg: f64) -> Self {
                    avg as $t
                }
            }
        )*
    };
}

impl_window_value_float!(f32, f64);

impl WindowValue for bool {
    fn type_min() -> Self {
        false
    }
    fn type_max() -> Self {
        true
    }
    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
    fn from_avg(avg: f64) -> Self {
        avg != 0.0
    }
}

/// Aggregates of one completed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats<T> {
    pub min: T,
    pub max: T,
    pub avg: T,
}

/// Min/max/avg over fixed wall-clock windows of one signal buffer.
#[derive(Debug, Clone)]
pub struct FixedTimeWindow<T: WindowValue> {
    window_size_ms: u64,
    /// Start of the window currently being collected.
    last_time_calculated: u64,
    /// Guards the bootstrap so a first sample at timestamp 0 does not make
    /// every later sample look like the first one.
    started: bool,
    last: Option<WindowStats<T>>,
    previous: Option<WindowStats<T>>,
    collecting_min: T,
    collecting_max: T,
    collecting_sum: f64,
    collected_count: u32,
}

impl<T: WindowValue> FixedTimeWindow<T> {
    pub fn new(window_size_ms: u64) -> Self {
        Self {
            window_size_ms,
            last_time_calculated: 0,
            started: false,
            last: None,
            previous: None,
            collecting_min: T::type_max(),
            collecting_max: T::type_min(),
            collecting_sum: 0.0,
            collected_count: 0,
        }
    }

    pub fn window_size_ms(&self) -> u64 {
        self.window_size_ms
    }

    /// Feed one sample at `timestamp_ms` (monotonic). Rotates completed
    /// windows first, then accumulates the sample into the current window.
    ///
    /// `next_window_times_out` is lowered to this window's next boundary so
    /// the worker knows how long it may sleep. Returns true when any
    /// completed-window value changed.
    pub fn add_value(&mut self, value: T, timestamp_ms: u64, next_window_times_out: &mut u64) -> bool {
        let changed = self.update_window(timestamp_ms, next_window_times_out);
        if value < self.collecting_min {
            self.collecting_min = value;
        }
        if value > self.collecting_max {
            self.collecting_max = value;
        }
        self.collecting_sum += value.to_f64();
        self.collected_count += 1;
        changed
    }

    /// Rotate completed windows purely on time passage, without a sample.
    /// Called when a window boundary elapses while the signal is silent, so
    /// window reads and the conditions over them still move forward.
    pub fn advance(&mut self, timestamp_ms: u64, next_window_times_out: &mut u64) -> bool {
        if !self.started {
            return false;
        }
        self.update_window(timestamp_ms, next_window_times_out)
    }

    fn update_window(&mut self, timestamp_ms: u64, next_window_times_out: &mut u64) -> bool {
        if !self.started {
            // First sample ever starts the window for this signal.
            self.started = true;
            self.last_time_calculated = timestamp_ms;
            self.init_new_window(timestamp_ms, next_window_times_out);
        } else if timestamp_ms >= self.last_time_calculated + self.window_size_ms * 2 {
            // Not a single sample arrived in the last full window.
            self.last = None;
            self.previous = self.finish_current();
            self.init_new_window(timestamp_ms, next_window_times_out);
        } else if timestamp_ms >= self.last_time_calculated + self.window_size_ms {
            self.previous = self.last;
            self.last = self.finish_current();
            self.init_new_window(timestamp_ms, next_window_times_out);
        } else {
            *next_window_times_out =
                (*next_window_times_out).min(self.last_time_calculated + self.window_size_ms);
            return false;
        }
        true
    }

    fn finish_current(&self) -> Option<WindowStats<T>> {
        if self.collected_count == 0 {
            return None;
        }
        Some(WindowStats {
            min: self.collecting_min,
            max: self.collecting_max,
            avg: T::from_avg(self.collecting_sum / f64::from(self.collected_count)),
        })
    }

    fn init_new_window(&mut self, timestamp_ms: u64, next_window_times_out: &mut u64) {
        self.collecting_min = T::type_max();
        self.collecting_max = T::type_min();
        self.collecting_sum = 0.0;
        self.collected_count = 0;
        // Catch up in whole windows so the boundary grid stays aligned even
        // after a long gap.
        self.last_time_calculated +=
            (timestamp_ms - self.last_time_calculated) / self.window_size_ms * self.window_size_ms;
        *next_window_times_out =
            (*next_window_times_out).min(self.last_time_calculated + self.window_size_ms);
    }

    pub fn last(&self) -> Option<&WindowStats<T>> {
        self.last.as_ref()
    }

    pub fn previous(&self) -> Option<&WindowStats<T>> {
        self.previous.as_ref()
    }

    /// Number of samples accumulated in the window currently collecting.
    pub fn collecting_count(&self) -> u32 {
        self.collected_count
    }
}
