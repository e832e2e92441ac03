//! Inspection worker thread.
//!
//! Owns the engine and is the only thread that ever touches it. Producers
//! reach it through the signal queue; matrix swaps and DTC snapshots are
//! staged under a mutex and applied at the loop head. The loop drains the
//! queue, evaluates, collects, and parks on the wake signal bounded by the
//! engine's next scheduled deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use vesper_common::{DtcInfo, SenderData, SignalDataFrame, TimePoint};

use crate::clock::Clock;
use crate::inspection::engine::{release_payload_handles, InspectionEngine};
use crate::inspection::matrix::InspectionMatrix;
use crate::metrics::Metrics;
use crate::queue::{BoundedQueue, WakeSignal};
use crate::rawbuf::RawBufferManager;

struct WorkerShared {
    should_stop: AtomicBool,
    wake: WakeSignal,
    pending_matrix: Mutex<Option<Arc<InspectionMatrix>>>,
    pending_dtcs: Mutex<Option<DtcInfo>>,
}

pub struct InspectionWorker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl InspectionWorker {
    /// Spawn the worker. The engine moves onto the thread; custom functions
    /// must be registered on it beforehand.
    pub fn start(
        mut engine: InspectionEngine,
        signal_queue: Arc<BoundedQueue<SignalDataFrame>>,
        output_queue: Arc<BoundedQueue<SenderData>>,
        raw_buffer_manager: Option<Arc<RawBufferManager>>,
        clock: Clock,
        metrics: Arc<Metrics>,
        idle_wait_ms: u64,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            should_stop: AtomicBool::new(false),
            wake: WakeSignal::new(),
            pending_matrix: Mutex::new(None),
            pending_dtcs: Mutex::new(None),
        });

        // New data on the signal queue wakes the loop.
        {
            let shared = Arc::clone(&shared);
            signal_queue.subscribe_new_data(move || shared.wake.notify());
        }

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("vesper-inspect".to_string())
            .spawn(move || {
                info!("inspection worker started");
                loop {
                    if thread_shared.should_stop.load(Ordering::Relaxed) {
                        let discarded = signal_queue.consume_all(|_| {});
                        if discarded > 0 {
                            info!("discarded {} frames on shutdown", discarded);
                        }
                        break;
                    }
                    if let Some(matrix) = thread_shared.pending_matrix.lock().unwrap().take() {
                        if let Err(error) =
                            engine.on_change_inspection_matrix(matrix, clock.time_point())
                        {
                            warn!("inspection matrix rejected: {}", error);
                        }
                    }
                    if let Some(dtcs) = thread_shared.pending_dtcs.lock().unwrap().take() {
                        engine.set_active_dtcs(dtcs);
                    }

                    let monotonic_now = clock.monotonic_ms();
                    signal_queue.consume_all(|frame: SignalDataFrame| {
                        if let Some(dtcs) = frame.active_dtcs {
                            engine.set_active_dtcs(dtcs);
                        }
                        for signal in frame.signals {
                            metrics.record_signal();
                            engine.add_new_signal(
                                signal.signal_id,
                                signal.fetch_request_id,
                                TimePoint::new(signal.receive_time_ms, monotonic_now),
                                monotonic_now,
                                signal.value,
                            );
                        }
                    });

                    engine.evaluate_conditions(clock.time_point());

                    let mut wait_ms = idle_wait_ms;
                    loop {
                        let (payload, engine_wait) =
                            engine.collect_next_data_to_send(clock.time_point());
                        wait_ms = engine_wait.min(idle_wait_ms);
                        match payload {
                            Some(payload) => {
                                match output_queue.push_or_reclaim(SenderData::Telemetry(payload)) {
                                    None => metrics.inc_payloads(),
                                    Some(rejected) => {
                                        metrics.inc_payloads_dropped();
                                        if let (
                                            SenderData::Telemetry(payload),
                                            Some(manager),
                                        ) = (&rejected, raw_buffer_manager.as_deref())
                                        {
                                            release_payload_handles(payload, manager);
                                        }
                                    }
                                }
                            }
                            None => break,
                        }
                    }

                    thread_shared
                        .wake
                        .wait(Some(Duration::from_millis(wait_ms.min(idle_wait_ms).max(1))));
                }
                info!("inspection worker stopped");
            })
            .expect("failed to spawn inspection worker");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Stage a new inspection matrix; the worker applies it on its thread.
    pub fn on_change_inspection_matrix(&self, matrix: Arc<InspectionMatrix>) {
        *self.shared.pending_matrix.lock().unwrap() = Some(matrix);
        self.shared.wake.notify();
    }

    pub fn set_active_dtcs(&self, active_dtcs: DtcInfo) {
        *self.shared.pending_dtcs.lock().unwrap() = Some(active_dtcs);
        self.shared.wake.notify();
    }

    /// Wake the loop; producers call this after pushing a burst.
    pub fn on_new_data_available(&self) {
        self.shared.wake.notify();
    }

    pub fn stop(&mut self) {
        self.shared.should_stop.store(true, Ordering::Relaxed);
        self.shared.wake.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for InspectionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
