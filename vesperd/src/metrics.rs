use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Global metrics for the inspection daemon.
///
/// Counters are updated from the hot path so all fields are atomic.
pub struct Metrics {
    pub signals_total: AtomicU64,
    pub start_time: SystemTime,
    // Per-second tracking
    signals_this_sec: AtomicU64,
    signals_per_sec: AtomicU64,
    queue_drops: AtomicU64,
    eval_errors: AtomicU64,
    conditions_triggered: AtomicU64,
    payloads_total: AtomicU64,
    payloads_dropped: AtomicU64,
    fetch_requests_total: AtomicU64,
    fetch_executions: AtomicU64,
    fetch_failures: AtomicU64,
    matrix_swaps: AtomicU64,
    matrix_swap_failures: AtomicU64,
    raw_rejects: AtomicU64,
    lks_updates: AtomicU64,
    lks_snapshots: AtomicU64,
    command_responses: AtomicU64,
    active_conditions: AtomicUsize,
    active_state_templates: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            signals_total: AtomicU64::new(0),
            start_time: SystemTime::now(),
            signals_this_sec: AtomicU64::new(0),
            signals_per_sec: AtomicU64::new(0),
            queue_drops: AtomicU64::new(0),
            eval_errors: AtomicU64::new(0),
            conditions_triggered: AtomicU64::new(0),
            payloads_total: AtomicU64::new(0),
            payloads_dropped: AtomicU64::new(0),
            fetch_requests_total: AtomicU64::new(0),
            fetch_executions: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            matrix_swaps: AtomicU64::new(0),
            matrix_swap_failures: AtomicU64::new(0),
            raw_rejects: AtomicU64::new(0),
            lks_updates: AtomicU64::new(0),
            lks_snapshots: AtomicU64::new(0),
            command_responses: AtomicU64::new(0),
            active_conditions: AtomicUsize::new(0),
            active_state_templates: AtomicUsize::new(0),
        }
    }

    /// Record one ingested signal sample.
    pub fn record_signal(&self) {
        self.signals_total.fetch_add(1, Ordering::Relaxed);
        self.signals_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once per second to refresh the signals-per-second metric.
    pub fn rollup(&self) {
        let per_sec = self.signals_this_sec.swap(0, Ordering::Relaxed);
        self.signals_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn signals_per_sec(&self) -> u64 {
        self.signals_per_sec.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn inc_queue_drop(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_drops(&self) -> u64 {
        self.queue_drops.load(Ordering::Relaxed)
    }

    pub fn inc_eval_error(&self) {
        self.eval_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn eval_errors(&self) -> u64 {
        self.eval_errors.load(Ordering::Relaxed)
    }

    pub fn inc_conditions_triggered(&self) {
        self.conditions_triggered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conditions_triggered(&self) -> u64 {
        self.conditions_triggered.load(Ordering::Relaxed)
    }

    pub fn inc_payloads(&self) {
        self.payloads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payloads_total(&self) -> u64 {
        self.payloads_total.load(Ordering::Relaxed)
    }

    pub fn inc_payloads_dropped(&self) {
        self.payloads_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payloads_dropped(&self) -> u64 {
        self.payloads_dropped.load(Ordering::Relaxed)
    }

    pub fn inc_fetch_requests(&self) {
        self.fetch_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_requests_total(&self) -> u64 {
        self.fetch_requests_total.load(Ordering::Relaxed)
    }

    pub fn inc_fetch_executions(&self) {
        self.fetch_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_executions(&self) -> u64 {
        self.fetch_executions.load(Ordering::Relaxed)
    }

    pub fn inc_fetch_failures(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures.load(Ordering::Relaxed)
    }

    pub fn inc_matrix_swaps(&self) {
        self.matrix_swaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn matrix_swaps(&self) -> u64 {
        self.matrix_swaps.load(Ordering::Relaxed)
    }

    pub fn inc_matrix_swap_failures(&self) {
        self.matrix_swap_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn matrix_swap_failures(&self) -> u64 {
        self.matrix_swap_failures.load(Ordering::Relaxed)
    }

    pub fn inc_raw_reject(&self) {
        self.raw_rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn raw_rejects(&self) -> u64 {
        self.raw_rejects.load(Ordering::Relaxed)
    }

    pub fn inc_lks_updates(&self) {
        self.lks_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lks_updates(&self) -> u64 {
        self.lks_updates.load(Ordering::Relaxed)
    }

    pub fn inc_lks_snapshots(&self) {
        self.lks_snapshots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lks_snapshots(&self) -> u64 {
        self.lks_snapshots.load(Ordering::Relaxed)
    }

    pub fn inc_command_responses(&self) {
        self.command_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_responses(&self) -> u64 {
        self.command_responses.load(Ordering::Relaxed)
    }

    pub fn set_active_conditions(&self, count: usize) {
        self.active_conditions.store(count, Ordering::Relaxed);
    }

    pub fn active_conditions(&self) -> usize {
        self.active_conditions.load(Ordering::Relaxed)
    }

    pub fn set_active_state_templates(&self, count: usize) {
        self.active_state_templates.store(count, Ordering::Relaxed);
    }

    pub fn active_state_templates(&self) -> usize {
        self.active_state_templates.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
