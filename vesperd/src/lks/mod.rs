//! Last-known-state inspector.
//!
//! Runs alongside the collection engine on its own worker, over its own copy
//! of the signal stream. For each state template it keeps the latest value
//! per listed signal and publishes on-change updates, periodic updates and
//! on-demand snapshots. Activation state survives restarts through a small
//! JSON metadata blob.

pub mod persist;
pub mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use vesper_common::{
    CollectedSignal, CommandResponse, CommandStatus, LastKnownStatePayload, PayloadSignal,
    SenderData, SignalId, SignalType, SignalValue, StateTemplateCommand, StateTemplateOperation,
    SyncId, TemplateSignals, TimePoint, INVALID_SIGNAL_ID, REASON_CODE_STATE_TEMPLATE_ALREADY_ACTIVATED,
    REASON_CODE_STATE_TEMPLATE_ALREADY_DEACTIVATED, REASON_CODE_STATE_TEMPLATE_OUT_OF_SYNC,
    REASON_CODE_UNSPECIFIED, REASON_DESCRIPTION_STATE_TEMPLATE_ALREADY_ACTIVATED,
    REASON_DESCRIPTION_STATE_TEMPLATE_ALREADY_DEACTIVATED,
};

use crate::lks::persist::{MetadataStore, STATE_TEMPLATES_KEY};
use crate::metrics::Metrics;
use crate::queue::BoundedQueue;

/// Bound on buffered on-change updates per template between collections.
const MAX_CHANGED_SIGNALS: usize = 1024;

/// How one template signal is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LksUpdateStrategy {
    /// Publish whenever the value changes.
    OnChange,
    /// Publish the latest value once per template period.
    Periodic,
}

fn default_update_strategy() -> LksUpdateStrategy {
    LksUpdateStrategy::OnChange
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LksSignalInfo {
    pub signal_id: SignalId,
    pub signal_type: SignalType,
    #[serde(default = "default_update_strategy")]
    pub update_strategy: LksUpdateStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTemplateInfo {
    pub id: SyncId,
    /// Period of the periodic update scheduler.
    #[serde(default)]
    pub period_ms: u64,
    pub signals: Vec<LksSignalInfo>,
}

/// Full set of state templates, versioned so stale swaps are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateTemplateList {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub templates: Vec<StateTemplateInfo>,
}

struct TemplateState {
    info: StateTemplateInfo,
    activated: bool,
    send_snapshot: bool,
    /// Monotonic deadline after which the template deactivates itself;
    /// 0 = no deadline.
    deactivate_after_monotonic_ms: u64,
    last_trigger: TimePoint,
    changed_signals: Vec<PayloadSignal>,
    periodic_pending: HashSet<SignalId>,
}

pub struct LastKnownStateInspector {
    templates: HashMap<SyncId, TemplateState>,
    latest: HashMap<SignalId, (SignalValue, u64)>,
    signal_types: HashMap<SignalId, SignalType>,
    last_accepted_version: u64,
    command_responses: Arc<BoundedQueue<SenderData>>,
    persistence: Option<MetadataStore>,
    persisted: Value,
    metrics: Arc<Metrics>,
}

impl LastKnownStateInspector {
    pub fn new(
        command_responses: Arc<BoundedQueue<SenderData>>,
        persistence: Option<MetadataStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let persisted = persistence
            .as_ref()
            .map(|store| store.read())
            .unwrap_or_else(|| json!({ STATE_TEMPLATES_KEY: {} }));
        Self {
            templates: HashMap::new(),
            latest: HashMap::new(),
            signal_types: HashMap::new(),
            last_accepted_version: 0,
            command_responses,
            persistence,
            persisted,
            metrics,
        }
    }

    /// Install a new template set. Returns false when the update is stale or
    /// invalid; the previous set stays active then.
    pub fn on_state_templates_changed(&mut self, list: &StateTemplateList, now: TimePoint) -> bool {
        if list.version < self.last_accepted_version {
            warn!(
                "state template update version {} is older than accepted version {}",
                list.version, self.last_accepted_version
            );
            return false;
        }
        for template in &list.templates {
            for signal in &template.signals {
                if signal.signal_id == INVALID_SIGNAL_ID {
                    warn!(
                        "state template {} lists the invalid signal id",
                        template.id
                    );
                    return false;
                }
            }
        }
        self.last_accepted_version = list.version;

        // No change in the template set: keep all runtime state.
        if self.templates.len() == list.templates.len()
            && list.templates.iter().all(|t| self.templates.contains_key(&t.id))
        {
            return true;
        }

        self.clear_unused(list);
        for template in &list.templates {
            let (activated, deactivate_after_monotonic_ms) =
                self.restored_metadata(&template.id, now);
            for signal in &template.signals {
                self.signal_types.insert(signal.signal_id, signal.signal_type);
            }
            self.templates.insert(
                template.id.clone(),
                TemplateState {
                    info: template.clone(),
                    activated,
                    send_snapshot: false,
                    deactivate_after_monotonic_ms,
                    last_trigger: now,
                    changed_signals: Vec::new(),
                    periodic_pending: HashSet::new(),
                },
            );
        }
        self.metrics.set_active_state_templates(self.templates.len());
        info!("state templates updated: {} active", self.templates.len());
        true
    }

    fn clear_unused(&mut self, list: &StateTemplateList) {
        let kept_templates: HashSet<&SyncId> = list.templates.iter().map(|t| &t.id).collect();
        let kept_signals: HashSet<SignalId> = list
            .templates
            .iter()
            .flat_map(|t| t.signals.iter().map(|s| s.signal_id))
            .collect();
        self.templates.retain(|id, _| kept_templates.contains(id));
        self.latest.retain(|id, _| kept_signals.contains(id));
        self.signal_types.retain(|id, _| kept_signals.contains(id));
    }

    /// Activation state restored from the persisted blob, with the system
    /// deadline converted onto the monotonic clock.
    fn restored_metadata(&self, template_id: &SyncId, now: TimePoint) -> (bool, u64) {
        let entry = &self.persisted[STATE_TEMPLATES_KEY][template_id];
        if !entry.is_object() {
            return (false, 0);
        }
        let activated = entry["activated"].as_bool().unwrap_or_else(|| {
            warn!(
                "persisted metadata for template {} lacks 'activated'",
                template_id
            );
            false
        });
        let mut deadline_monotonic = 0;
        if let Some(deadline_system) = entry["deactivateAfterSystemTimeMs"].as_u64() {
            if deadline_system > now.system_time_ms {
                deadline_monotonic =
                    now.monotonic_time_ms + (deadline_system - now.system_time_ms);
            }
        }
        (activated, deadline_monotonic)
    }

    /// Feed one sample. Only signals listed by some template are tracked.
    pub fn on_new_signal(&mut self, signal: &CollectedSignal) {
        let Some(expected_type) = self.signal_types.get(&signal.signal_id) else {
            return;
        };
        if signal.value.signal_type() != *expected_type {
            debug!(
                "dropping sample for signal {}: type {:?} does not match template type {:?}",
                signal.signal_id,
                signal.value.signal_type(),
                expected_type
            );
            return;
        }
        let changed = self
            .latest
            .get(&signal.signal_id)
            .map(|(value, _)| *value != signal.value)
            .unwrap_or(true);
        self.latest
            .insert(signal.signal_id, (signal.value, signal.receive_time_ms));

        for template in self.templates.values_mut() {
            let Some(info) = template
                .info
                .signals
                .iter()
                .find(|s| s.signal_id == signal.signal_id)
            else {
                continue;
            };
            if !template.activated {
                continue;
            }
            match info.update_strategy {
                LksUpdateStrategy::OnChange => {
                    if changed && template.changed_signals.len() < MAX_CHANGED_SIGNALS {
                        template.changed_signals.push(PayloadSignal {
                            signal_id: signal.signal_id,
                            timestamp_ms: signal.receive_time_ms,
                            value: signal.value,
                            signal_type: *expected_type,
                        });
                    }
                }
                LksUpdateStrategy::Periodic => {
                    template.periodic_pending.insert(signal.signal_id);
                }
            }
        }
    }

    /// Handle an inbound command and emit the command response.
    pub fn on_new_command(&mut self, command: &StateTemplateCommand) {
        let Some(template) = self.templates.get_mut(&command.template_id) else {
            warn!(
                "command {} addresses missing state template {}",
                command.command_id, command.template_id
            );
            self.respond(
                &command.command_id,
                CommandStatus::ExecutionFailed,
                REASON_CODE_STATE_TEMPLATE_OUT_OF_SYNC,
                "Received a command for missing state template.",
            );
            return;
        };

        let mut reason_code = REASON_CODE_UNSPECIFIED;
        let mut reason_description = "";
        match command.operation {
            StateTemplateOperation::Activate => {
                if template.activated {
                    info!(
                        "updating already activated state template {}",
                        command.template_id
                    );
                    reason_code = REASON_CODE_STATE_TEMPLATE_ALREADY_ACTIVATED;
                    reason_description = REASON_DESCRIPTION_STATE_TEMPLATE_ALREADY_ACTIVATED;
                } else {
                    info!("activating state template {}", command.template_id);
                }
                template.activated = true;
                template.send_snapshot = true;
                // Periodic updates restart from the command arrival.
                template.last_trigger = command.received_time;

                let mut deadline_system = 0;
                if command.deactivate_after_seconds == 0 {
                    template.deactivate_after_monotonic_ms = 0;
                } else {
                    let offset = u64::from(command.deactivate_after_seconds) * 1000;
                    template.deactivate_after_monotonic_ms =
                        command.received_time.monotonic_time_ms + offset;
                    deadline_system = command.received_time.system_time_ms + offset;
                }
                let template_id = command.template_id.clone();
                self.persist_template(&template_id, true, deadline_system);
            }
            StateTemplateOperation::Deactivate => {
                if template.activated {
                    info!("deactivating state template {}", command.template_id);
                    template.activated = false;
                    template.deactivate_after_monotonic_ms = 0;
                    let template_id = command.template_id.clone();
                    self.remove_persisted(&template_id);
                } else {
                    info!(
                        "state template {} is already deactivated",
                        command.template_id
                    );
                    reason_code = REASON_CODE_STATE_TEMPLATE_ALREADY_DEACTIVATED;
                    reason_description = REASON_DESCRIPTION_STATE_TEMPLATE_ALREADY_DEACTIVATED;
                }
            }
            StateTemplateOperation::FetchSnapshot => {
                info!(
                    "scheduling a snapshot for state template {}",
                    command.template_id
                );
                template.send_snapshot = true;
            }
        }

        self.respond(
            &command.command_id,
            CommandStatus::Succeeded,
            reason_code,
            reason_description,
        );
    }

    fn respond(&self, command_id: &str, status: CommandStatus, reason_code: u32, reason: &str) {
        let response = SenderData::CommandResponse(CommandResponse {
            command_id: command_id.to_string(),
            status,
            reason_code,
            reason_description: reason.to_string(),
        });
        if self.command_responses.push(response) {
            self.metrics.inc_command_responses();
        } else {
            self.metrics.inc_queue_drop();
        }
    }

    /// Gather everything due now: expired deactivations, snapshots, periodic
    /// updates and buffered on-change updates.
    pub fn collect_next_data_to_send(&mut self, now: TimePoint) -> Option<LastKnownStatePayload> {
        let mut expired: Vec<SyncId> = Vec::new();
        let mut payload = LastKnownStatePayload {
            trigger_time_ms: now.system_time_ms,
            templates: Vec::new(),
        };

        let mut template_ids: Vec<SyncId> = self.templates.keys().cloned().collect();
        template_ids.sort();
        for template_id in template_ids {
            let template = self.templates.get_mut(&template_id).unwrap();

            if template.deactivate_after_monotonic_ms != 0
                && now.monotonic_time_ms > template.deactivate_after_monotonic_ms
            {
                info!("state template {} activation expired", template_id);
                template.activated = false;
                template.deactivate_after_monotonic_ms = 0;
                expired.push(template_id.clone());
            }

            let mut signals_to_send: Vec<PayloadSignal> = Vec::new();
            if template.send_snapshot {
                template.send_snapshot = false;
                for info in &template.info.signals {
                    match self.latest.get(&info.signal_id) {
                        Some((value, timestamp_ms)) => signals_to_send.push(PayloadSignal {
                            signal_id: info.signal_id,
                            timestamp_ms: *timestamp_ms,
                            value: *value,
                            signal_type: info.signal_type,
                        }),
                        None => debug!(
                            "no value yet for signal {} in snapshot of {}",
                            info.signal_id, template_id
                        ),
                    }
                }
                // The snapshot covers everything; pending periodic updates
                // would only repeat it.
                template.periodic_pending.clear();
                template.last_trigger = now;
                self.metrics.inc_lks_snapshots();
            } else if template.activated {
                signals_to_send = std::mem::take(&mut template.changed_signals);
                if now.monotonic_time_ms - template.last_trigger.monotonic_time_ms
                    >= template.info.period_ms
                    && template.info.period_ms != 0
                {
                    for signal_id in template.periodic_pending.iter() {
                        if let Some((value, timestamp_ms)) = self.latest.get(signal_id) {
                            let signal_type = self
                                .signal_types
                                .get(signal_id)
                                .copied()
                                .unwrap_or_else(|| value.signal_type());
                            signals_to_send.push(PayloadSignal {
                                signal_id: *signal_id,
                                timestamp_ms: *timestamp_ms,
                                value: *value,
                                signal_type,
                            });
                        }
                    }
                    template.periodic_pending.clear();
                    template.last_trigger = now;
                }
            }

            template.changed_signals = Vec::new();

            if signals_to_send.is_empty() {
                continue;
            }
            payload.templates.push(TemplateSignals {
                template_id: template_id.clone(),
                signals: signals_to_send,
            });
        }

        for template_id in expired {
            self.remove_persisted(&template_id);
        }

        if payload.templates.is_empty() {
            return None;
        }
        self.metrics.inc_lks_updates();
        Some(payload)
    }

    /// Milliseconds until the nearest periodic trigger or deactivation
    /// deadline, if any template schedules one.
    pub fn next_wait_hint(&self, now: TimePoint) -> Option<u64> {
        let mut wait: Option<u64> = None;
        let mut consider = |deadline_monotonic: u64| {
            let remaining = deadline_monotonic.saturating_sub(now.monotonic_time_ms);
            wait = Some(wait.map_or(remaining, |w| w.min(remaining)));
        };
        for template in self.templates.values() {
            if template.activated && template.info.period_ms != 0 {
                consider(template.last_trigger.monotonic_time_ms + template.info.period_ms);
            }
            if template.deactivate_after_monotonic_ms != 0 {
                consider(template.deactivate_after_monotonic_ms);
            }
        }
        wait
    }

    fn persist_template(&mut self, template_id: &SyncId, activated: bool, deadline_system_ms: u64) {
        self.persisted[STATE_TEMPLATES_KEY][template_id] = json!({
            "activated": activated,
            "deactivateAfterSystemTimeMs": deadline_system_ms,
        });
        if let Some(store) = &self.persistence {
            store.write(&self.persisted);
        }
    }

    fn remove_persisted(&mut self, template_id: &SyncId) {
        if let Some(map) = self.persisted[STATE_TEMPLATES_KEY].as_object_mut() {
            map.remove(template_id);
        }
        if let Some(store) = &self.persistence {
            store.write(&self.persisted);
        }
    }
}
