//! Last-known-state worker thread.
//!
//! Same shape as the inspection worker: owns the inspector, drains its own
//! signal queue and the command queue, publishes updates onto the outbound
//! queue, and parks bounded by the nearest periodic trigger or deactivation
//! deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::info;

use vesper_common::{SenderData, SignalDataFrame, StateTemplateCommand};

use crate::clock::Clock;
use crate::lks::{LastKnownStateInspector, StateTemplateList};
use crate::metrics::Metrics;
use crate::queue::{BoundedQueue, WakeSignal};

struct LksWorkerShared {
    should_stop: AtomicBool,
    wake: WakeSignal,
    pending_templates: Mutex<Option<Arc<StateTemplateList>>>,
}

pub struct LastKnownStateWorker {
    shared: Arc<LksWorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl LastKnownStateWorker {
    pub fn start(
        mut inspector: LastKnownStateInspector,
        signal_queue: Arc<BoundedQueue<SignalDataFrame>>,
        command_queue: Arc<BoundedQueue<StateTemplateCommand>>,
        output_queue: Arc<BoundedQueue<SenderData>>,
        clock: Clock,
        metrics: Arc<Metrics>,
        idle_wait_ms: u64,
    ) -> Self {
        let shared = Arc::new(LksWorkerShared {
            should_stop: AtomicBool::new(false),
            wake: WakeSignal::new(),
            pending_templates: Mutex::new(None),
        });

        // Both queues wake the same loop.
        {
            let shared = Arc::clone(&shared);
            signal_queue.subscribe_new_data(move || shared.wake.notify());
        }
        {
            let shared = Arc::clone(&shared);
            command_queue.subscribe_new_data(move || shared.wake.notify());
        }

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("vesper-lks".to_string())
            .spawn(move || {
                info!("last-known-state worker started");
                loop {
                    if thread_shared.should_stop.load(Ordering::Relaxed) {
                        signal_queue.consume_all(|_| {});
                        command_queue.consume_all(|_| {});
                        break;
                    }
                    if let Some(templates) = thread_shared.pending_templates.lock().unwrap().take()
                    {
                        inspector.on_state_templates_changed(&templates, clock.time_point());
                    }
                    command_queue.consume_all(|command: StateTemplateCommand| {
                        inspector.on_new_command(&command);
                    });
                    signal_queue.consume_all(|frame: SignalDataFrame| {
                        for signal in &frame.signals {
                            inspector.on_new_signal(signal);
                        }
                    });

                    let now = clock.time_point();
                    if let Some(payload) = inspector.collect_next_data_to_send(now) {
                        if !output_queue.push(SenderData::LastKnownState(payload)) {
                            metrics.inc_queue_drop();
                        }
                    }

                    let wait = inspector
                        .next_wait_hint(clock.time_point())
                        .unwrap_or(idle_wait_ms)
                        .min(idle_wait_ms)
                        .max(1);
                    thread_shared.wake.wait(Some(Duration::from_millis(wait)));
                }
                info!("last-known-state worker stopped");
            })
            .expect("failed to spawn last-known-state worker");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Stage a new template set; the worker applies it on its thread.
    pub fn on_change_state_templates(&self, templates: Arc<StateTemplateList>) {
        *self.shared.pending_templates.lock().unwrap() = Some(templates);
        self.shared.wake.notify();
    }

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

impl Drop for LastKnownStateWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
