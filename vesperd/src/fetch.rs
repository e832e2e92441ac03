//! Data fetch manager: executes on-demand and periodic fetch actions.
//!
//! The inspection engine emits fetch-request ids onto the fetch queue when
//! an expression asks for fresh data; this module drains that queue and also
//! runs the periodic requests declared in the fetch matrix, dispatching each
//! action to a registered fetch function (e.g. a UDS DTC query).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use vesper_common::{FetchRequestId, SignalId};

use crate::clock::Clock;
use crate::inspection::expr::InspectionValue;
use crate::metrics::Metrics;
use crate::queue::{BoundedQueue, WakeSignal};

/// Why a fetch function did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchError {
    SignalNotFound,
    UnsupportedParameters,
    /// The function was asked to stop; not treated as a failure.
    RequestedToStop,
    NotImplemented,
}

pub type FetchResult = Result<(), FetchError>;

/// A registered fetch function, invoked per action of a fetch request.
pub type CustomFetchFunction =
    Arc<dyn Fn(SignalId, FetchRequestId, &[InspectionValue]) -> FetchResult + Send + Sync>;

/// One action of a fetch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchAction {
    pub signal_id: SignalId,
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<InspectionValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicalFetchParameters {
    pub fetch_frequency_ms: u64,
    /// Accepted from the scheme but not enforced in this release.
    #[serde(default)]
    pub max_execution_count: u64,
    /// Accepted from the scheme but not enforced in this release.
    #[serde(default)]
    pub reset_period_ms: u64,
}

/// All fetch requests of the active collection schemes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchMatrix {
    #[serde(default)]
    pub fetch_requests: HashMap<FetchRequestId, Vec<FetchAction>>,
    #[serde(default)]
    pub periodical: HashMap<FetchRequestId, PeriodicalFetchParameters>,
}

/// Matrix-driven dispatch state, separate from the thread so it can be
/// exercised directly.
struct FetchCore {
    matrix: Option<Arc<FetchMatrix>>,
    functions: HashMap<String, CustomFetchFunction>,
    last_execution: HashMap<FetchRequestId, u64>,
    metrics: Arc<Metrics>,
}

impl FetchCore {
    fn execute_fetch(&mut self, fetch_request_id: FetchRequestId) -> FetchResult {
        let Some(matrix) = &self.matrix else {
            return Err(FetchError::NotImplemented);
        };
        let Some(actions) = matrix.fetch_requests.get(&fetch_request_id) else {
            warn!("unknown fetch request id {}", fetch_request_id);
            return Err(FetchError::SignalNotFound);
        };
        if actions.is_empty() {
            warn!("no actions for fetch request id {}", fetch_request_id);
            return Err(FetchError::SignalNotFound);
        }
        for action in actions {
            let Some(function) = self.functions.get(&action.function_name) else {
                warn!("unknown fetch function {}", action.function_name);
                continue;
            };
            debug!(
                "dispatching fetch request {} for signal {}",
                fetch_request_id, action.signal_id
            );
            self.metrics.inc_fetch_executions();
            let result = function(action.signal_id, fetch_request_id, &action.args);
            match result {
                Ok(()) | Err(FetchError::RequestedToStop) => {}
                Err(error) => {
                    self.metrics.inc_fetch_failures();
                    warn!(
                        "fetch function {} failed for signal {}: {:?}",
                        action.function_name, action.signal_id, error
                    );
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Run every periodic request whose interval elapsed. Returns the
    /// milliseconds until the nearest next execution, if any is scheduled.
    fn run_due_periodic(&mut self, monotonic_now_ms: u64) -> Option<u64> {
        let Some(matrix) = self.matrix.clone() else {
            return None;
        };
        let mut min_wait: Option<u64> = None;
        for (request_id, parameters) in &matrix.periodical {
            let last = self.last_execution.get(request_id).copied().unwrap_or(0);
            if last == 0 || monotonic_now_ms.saturating_sub(last) >= parameters.fetch_frequency_ms {
                let _ = self.execute_fetch(*request_id);
                self.last_execution.insert(*request_id, monotonic_now_ms);
            }
            let last = self.last_execution.get(request_id).copied().unwrap_or(0);
            let next = last + parameters.fetch_frequency_ms;
            let wait = next.saturating_sub(monotonic_now_ms);
            min_wait = Some(min_wait.map_or(wait, |w: u64| w.min(wait)));
        }
        min_wait
    }
}

struct FetchWorkerShared {
    should_stop: AtomicBool,
    wake: WakeSignal,
    pending_matrix: Mutex<Option<Arc<FetchMatrix>>>,
}

/// The fetch worker thread and the handle to drive it.
pub struct DataFetchManager {
    shared: Arc<FetchWorkerShared>,
    thread: Option<JoinHandle<()>>,
}

/// Collects fetch functions before the worker starts.
#[derive(Default)]
pub struct FetchFunctionRegistry {
    functions: HashMap<String, CustomFetchFunction>,
}

impl FetchFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, function: CustomFetchFunction) {
        let name = name.into();
        debug!("registered fetch function {}", name);
        self.functions.insert(name, function);
    }
}

impl DataFetchManager {
    pub fn start(
        fetch_queue: Arc<BoundedQueue<FetchRequestId>>,
        registry: FetchFunctionRegistry,
        clock: Clock,
        metrics: Arc<Metrics>,
    ) -> Self {
        let shared = Arc::new(FetchWorkerShared {
            should_stop: AtomicBool::new(false),
            wake: WakeSignal::new(),
            pending_matrix: Mutex::new(None),
        });

        {
            let shared = Arc::clone(&shared);
            fetch_queue.subscribe_new_data(move || shared.wake.notify());
        }

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("vesper-fetch".to_string())
            .spawn(move || {
                info!("fetch worker started");
                let mut core = FetchCore {
                    matrix: None,
                    functions: registry.functions,
                    last_execution: HashMap::new(),
                    metrics,
                };
                loop {
                    if thread_shared.should_stop.load(Ordering::Relaxed) {
                        let discarded = fetch_queue.consume_all(|_| {});
                        if discarded > 0 {
                            info!("discarded {} fetch requests on shutdown", discarded);
                        }
                        break;
                    }
                    if let Some(matrix) = thread_shared.pending_matrix.lock().unwrap().take() {
                        info!("fetch matrix updated");
                        core.matrix = Some(matrix);
                    }

                    let mut wait = None;
                    if core.matrix.is_some() {
                        fetch_queue.consume_all(|request_id| {
                            // A failing request aborts its own actions only;
                            // the drain continues.
                            let _ = core.execute_fetch(request_id);
                        });
                        wait = core.run_due_periodic(clock.monotonic_ms());
                    }

                    thread_shared
                        .wake
                        .wait(wait.map(|ms| Duration::from_millis(ms.max(1))));
                }
                info!("fetch worker stopped");
            })
            .expect("failed to spawn fetch worker");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Stage a new fetch matrix; the worker picks it up on its thread.
    pub fn on_change_fetch_matrix(&self, matrix: Arc<FetchMatrix>) {
        *self.shared.pending_matrix.lock().unwrap() = Some(matrix);
        self.shared.wake.notify();
    }

    /// Wake the worker after fetch requests were queued.
    pub fn on_new_fetch_request_available(&self) {
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

impl Drop for DataFetchManager {
    fn drop(&mut self) {
        self.stop();
    }
}
