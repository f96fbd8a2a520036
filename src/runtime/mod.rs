//! Instance state machine and run loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::ClientCore;
use crate::error::{EngineError, NotFoundKind};
use crate::history::{HistoryEvent, RuntimeStatus};
use crate::registry::OrchestrationHandler;
use crate::runtime::timers::{OrchestrationTimer, VirtualClock, WaitToken};

pub mod context;
pub mod entity;
pub(crate) mod timers;

/// Shared record of one orchestration instance. The spawned run task is the
/// single logical writer; the cross-task writes are raise-event (wait-token
/// table), time-shift (clock + timer force-fires), suspend/resume, and
/// terminate.
pub(crate) struct InstanceShared {
    pub instance_id: String,
    pub parent_instance_id: Option<String>,
    pub name: String,
    pub created_time_ms: u64,
    pub clock: VirtualClock,
    pub input: Mutex<Value>,
    pub output: Mutex<Option<Value>>,
    pub custom_status: Mutex<Option<Value>>,
    pub failure: Mutex<Option<EngineError>>,
    pub status: Mutex<RuntimeStatus>,
    pub history: Mutex<Vec<HistoryEvent>>,
    pub event_tokens: Mutex<HashMap<String, Arc<WaitToken>>>,
    pub active_timers: Mutex<Vec<Arc<OrchestrationTimer>>>,
    pub children: Mutex<Vec<Arc<InstanceShared>>>,
    pub pending_restart: Mutex<Option<Value>>,
    pub cancellation: CancellationToken,
    suspended: watch::Sender<bool>,
    child_seq: AtomicU64,
}

impl InstanceShared {
    pub fn new(
        instance_id: String,
        parent_instance_id: Option<String>,
        name: String,
        input: Value,
        start_time_ms: u64,
    ) -> Self {
        let (suspended, _) = watch::channel(false);
        Self {
            instance_id,
            parent_instance_id,
            name,
            created_time_ms: start_time_ms,
            clock: VirtualClock::starting_at(start_time_ms),
            input: Mutex::new(input),
            output: Mutex::new(None),
            custom_status: Mutex::new(None),
            failure: Mutex::new(None),
            status: Mutex::new(RuntimeStatus::Pending),
            history: Mutex::new(Vec::new()),
            event_tokens: Mutex::new(HashMap::new()),
            active_timers: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            pending_restart: Mutex::new(None),
            cancellation: CancellationToken::new(),
            suspended,
            child_seq: AtomicU64::new(0),
        }
    }

    /// Append a history event, assigning the next strictly-increasing id and
    /// the current virtual timestamp. Returns the assigned id.
    pub fn append(&self, build: impl FnOnce(u64, u64) -> HistoryEvent) -> u64 {
        let mut history = self.history.lock().unwrap();
        let event_id = history.len() as u64 + 1;
        history.push(build(event_id, self.clock.now_ms()));
        event_id
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: RuntimeStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn next_child_seq(&self) -> u64 {
        self.child_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Deliver an external event. Returns true when a pending wait consumed
    /// it; otherwise the event is dropped (no wait registered for the name).
    pub fn notify_external_event(&self, name: &str, data: Value) -> bool {
        let token = self.event_tokens.lock().unwrap().get(name).cloned();
        match token {
            Some(token) if token.is_pending() => {
                self.append(|id, ts| HistoryEvent::ExternalEventReceived {
                    event_id: id,
                    timestamp_ms: ts,
                    name: name.to_string(),
                    data: data.clone(),
                });
                token.settle(data);
                true
            }
            _ => false,
        }
    }

    pub fn is_waiting_for_event(&self, name: &str) -> bool {
        self.event_tokens
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|t| t.is_pending())
    }

    /// Advance this instance's virtual clock, force-fire every timer whose
    /// due time has been reached, and cascade into live sub-orchestrations.
    pub fn timeshift(&self, delta_ms: u64) {
        let now_ms = self.clock.advance(delta_ms);
        let timers: Vec<_> = self.active_timers.lock().unwrap().clone();
        for timer in timers {
            timer.time_changed(now_ms);
        }
        let children: Vec<_> = self.children.lock().unwrap().clone();
        for child in children {
            child.timeshift(delta_ms);
        }
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.send_replace(suspended);
    }

    pub fn subscribe_suspended(&self) -> watch::Receiver<bool> {
        self.suspended.subscribe()
    }

    fn take_pending_restart(&self) -> Option<Value> {
        self.pending_restart.lock().unwrap().take()
    }

    /// Continue-as-new cleanup: custom status and every outstanding wait
    /// token are dropped. Waiters racing this observe a canceled token.
    fn reset_for_new_execution(&self, input: Value) {
        *self.custom_status.lock().unwrap() = None;
        let mut tokens = self.event_tokens.lock().unwrap();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.clear();
        drop(tokens);
        *self.input.lock().unwrap() = input;
    }
}

/// Drive one instance to a terminal state, looping on continue-as-new.
/// Runs as its own tokio task for top-level starts and inline for
/// sub-orchestrations.
pub(crate) async fn run_instance(core: Arc<ClientCore>, shared: Arc<InstanceShared>) {
    loop {
        let input = shared.input.lock().unwrap().clone();
        shared.set_status(RuntimeStatus::Running);
        shared.append(|id, ts| HistoryEvent::ExecutionStarted {
            event_id: id,
            timestamp_ms: ts,
            name: shared.name.clone(),
            input: input.clone(),
        });
        debug!(instance = %shared.instance_id, orchestration = %shared.name, "starting execution");

        let outcome = match core.orchestrations.get(&shared.name) {
            Some(handler) => {
                let ctx = context::OrchestrationContext::new(shared.clone(), core.clone());
                handler.invoke(ctx, input).await
            }
            None => Err(EngineError::not_found(
                NotFoundKind::Orchestration,
                &shared.name,
            )),
        };

        if let Some(new_input) = shared.take_pending_restart() {
            shared.reset_for_new_execution(new_input);
            debug!(instance = %shared.instance_id, "continuing as new");
            continue;
        }

        match outcome {
            Ok(output) => {
                *shared.output.lock().unwrap() = Some(output.clone());
                shared.set_status(RuntimeStatus::Completed);
                shared.append(|id, ts| HistoryEvent::ExecutionCompleted {
                    event_id: id,
                    timestamp_ms: ts,
                    status: RuntimeStatus::Completed,
                    output: Some(output),
                });
                debug!(instance = %shared.instance_id, "execution completed");
            }
            Err(e) => {
                *shared.failure.lock().unwrap() = Some(e.clone());
                shared.set_status(RuntimeStatus::Failed);
                shared.append(|id, ts| HistoryEvent::TaskFailed {
                    event_id: id,
                    timestamp_ms: ts,
                    scheduled_id: 0,
                    reason: e.to_string(),
                    details: e.details(),
                });
                shared.append(|id, ts| HistoryEvent::ExecutionCompleted {
                    event_id: id,
                    timestamp_ms: ts,
                    status: RuntimeStatus::Failed,
                    output: None,
                });
                warn!(instance = %shared.instance_id, error = %e, "execution failed");
            }
        }
        break;
    }
}
