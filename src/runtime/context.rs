//! Execution contexts handed to orchestration and activity bodies.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::client::ClientCore;
use crate::error::{EngineError, NotFoundKind};
use crate::history::HistoryEvent;
use crate::http::{DurableHttpRequest, DurableHttpResponse};
use crate::registry::ActivityHandler;
use crate::retry::RetryPolicy;
use crate::runtime::entity::EntityId;
use crate::runtime::timers::{OrchestrationTimer, TimerOutcome, WaitToken};
use crate::runtime::{run_instance, InstanceShared};

enum CallKind {
    Activity,
    SubOrchestration,
}

/// The orchestration body's handle to its own instance. Cheap to clone; all
/// call primitives suspend cooperatively and record paired history events.
#[derive(Clone)]
pub struct OrchestrationContext {
    shared: Arc<InstanceShared>,
    core: Arc<ClientCore>,
}

impl OrchestrationContext {
    pub(crate) fn new(shared: Arc<InstanceShared>, core: Arc<ClientCore>) -> Self {
        Self { shared, core }
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    pub fn parent_instance_id(&self) -> Option<&str> {
        self.shared.parent_instance_id.as_deref()
    }

    /// Logical orchestration function name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current virtual time in epoch milliseconds.
    pub fn current_time_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    pub fn created_time_ms(&self) -> u64 {
        self.shared.created_time_ms
    }

    /// The instance's current input (replaced by continue-as-new).
    pub fn input(&self) -> Value {
        self.shared.input.lock().unwrap().clone()
    }

    pub fn input_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_value(self.input())
            .map_err(|e| EngineError::activity(format!("decode input: {e}")))
    }

    pub fn custom_status(&self) -> Option<Value> {
        self.shared.custom_status.lock().unwrap().clone()
    }

    pub fn new_guid(&self) -> Uuid {
        Uuid::new_v4()
    }

    /// Visible immediately to status readers; `Value::Null` clears it.
    pub fn set_custom_status(&self, value: Value) {
        let mut slot = self.shared.custom_status.lock().unwrap();
        *slot = if value.is_null() { None } else { Some(value) };
    }

    /// Request an in-place restart with a new input. Takes effect when the
    /// body returns: custom status and all outstanding wait tokens are
    /// cleared, a fresh execution segment is appended, and the body runs
    /// again. Unprocessed external events are dropped.
    pub fn continue_as_new(&self, input: Value) {
        *self.shared.pending_restart.lock().unwrap() = Some(input);
    }

    /// Invoke the named activity with a deep, independent copy of `input`.
    /// Failure is returned to the caller as a catchable error.
    pub async fn call_activity(
        &self,
        name: impl Into<String>,
        input: Value,
    ) -> Result<Value, EngineError> {
        let name = name.into();
        self.await_resumed().await;
        let scheduled_id = self.shared.append(|id, ts| HistoryEvent::TaskScheduled {
            event_id: id,
            timestamp_ms: ts,
            name: name.clone(),
        });
        let result = self.invoke_activity(&name, input).await;
        match result {
            Ok(value) => {
                self.shared.append(|id, ts| HistoryEvent::TaskCompleted {
                    event_id: id,
                    timestamp_ms: ts,
                    scheduled_id,
                    result: value.clone(),
                });
                Ok(value)
            }
            Err(e) => {
                self.shared.append(|id, ts| HistoryEvent::TaskFailed {
                    event_id: id,
                    timestamp_ms: ts,
                    scheduled_id,
                    reason: e.to_string(),
                    details: e.details(),
                });
                Err(e)
            }
        }
    }

    async fn invoke_activity(&self, name: &str, input: Value) -> Result<Value, EngineError> {
        let handler = self
            .core
            .activities
            .get(name)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Activity, name))?;
        // copy-on-call: the context owns the value outright, so nothing the
        // activity does to it can reach the orchestration's copy
        let ctx = ActivityContext {
            instance_id: self.shared.instance_id.clone(),
            name: name.to_string(),
            input,
            services: self.core.services.clone(),
            cancellation: self.shared.cancellation.child_token(),
        };
        handler.invoke(ctx).await
    }

    /// Run a child orchestration to completion, with a generated instance id.
    pub async fn call_sub_orchestrator(
        &self,
        name: impl Into<String>,
        input: Value,
    ) -> Result<Value, EngineError> {
        let seq = self.shared.next_child_seq();
        let child_id = format!("{}:sub-{}", self.shared.instance_id, seq);
        self.call_sub_orchestrator_with_id(name, child_id, input).await
    }

    /// Run a child orchestration to completion under an explicit instance id.
    /// The child gets its own clock (seeded from the parent's current virtual
    /// time) and its own history; only the created/completed-or-failed pair is
    /// folded into the parent's log.
    pub async fn call_sub_orchestrator_with_id(
        &self,
        name: impl Into<String>,
        instance_id: impl Into<String>,
        input: Value,
    ) -> Result<Value, EngineError> {
        let name = name.into();
        let instance_id = instance_id.into();
        self.await_resumed().await;

        let child = Arc::new(InstanceShared::new(
            instance_id.clone(),
            Some(self.shared.instance_id.clone()),
            name.clone(),
            input,
            self.shared.clock.now_ms(),
        ));
        let scheduled_id = self
            .shared
            .append(|id, ts| HistoryEvent::SubOrchestrationCreated {
                event_id: id,
                timestamp_ms: ts,
                name: name.clone(),
                instance: instance_id.clone(),
            });

        // registered with the parent so a time-shift cascades into the child
        self.shared.children.lock().unwrap().push(child.clone());
        run_instance(self.core.clone(), child.clone()).await;
        self.shared
            .children
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, &child));

        if child.status() == crate::RuntimeStatus::Completed {
            let output = child.output.lock().unwrap().clone().unwrap_or(Value::Null);
            self.shared
                .append(|id, ts| HistoryEvent::SubOrchestrationCompleted {
                    event_id: id,
                    timestamp_ms: ts,
                    scheduled_id,
                    result: output.clone(),
                });
            Ok(output)
        } else {
            let err = child
                .failure
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| EngineError::activity(format!("sub-orchestration `{name}` failed")));
            self.shared
                .append(|id, ts| HistoryEvent::SubOrchestrationFailed {
                    event_id: id,
                    timestamp_ms: ts,
                    scheduled_id,
                    reason: err.to_string(),
                    details: err.details(),
                });
            Err(err)
        }
    }

    /// Retry wrapper around `call_activity`. Exhausting the policy rethrows
    /// the last failure; non-retryable failures rethrow immediately.
    pub async fn call_activity_with_retry(
        &self,
        name: impl Into<String>,
        policy: RetryPolicy,
        input: Value,
    ) -> Result<Value, EngineError> {
        self.retry_loop(name.into(), policy, input, CallKind::Activity)
            .await
    }

    /// Retry wrapper around `call_sub_orchestrator`.
    pub async fn call_sub_orchestrator_with_retry(
        &self,
        name: impl Into<String>,
        policy: RetryPolicy,
        input: Value,
    ) -> Result<Value, EngineError> {
        self.retry_loop(name.into(), policy, input, CallKind::SubOrchestration)
            .await
    }

    async fn retry_loop(
        &self,
        name: String,
        policy: RetryPolicy,
        input: Value,
        kind: CallKind,
    ) -> Result<Value, EngineError> {
        let first_attempt_ms = self.shared.clock.now_ms();
        let mut attempt: u32 = 1;
        loop {
            let result = match kind {
                CallKind::Activity => self.call_activity(name.clone(), input.clone()).await,
                CallKind::SubOrchestration => {
                    self.call_sub_orchestrator(name.clone(), input.clone()).await
                }
            };
            let failure = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !failure.is_retryable() {
                return Err(failure);
            }
            let now_ms = self.shared.clock.now_ms();
            let delay_ms = match policy.next_delay_ms(
                attempt,
                first_attempt_ms,
                now_ms,
                &failure,
                self.core.options.use_delays_for_retries,
            ) {
                Some(delay) => delay,
                None => return Err(failure),
            };
            self.shared.append(|id, ts| HistoryEvent::Generic {
                event_id: id,
                timestamp_ms: ts,
                message: format!(
                    "Delaying {:.3} seconds before retry attempt {} for {}",
                    delay_ms as f64 / 1000.0,
                    attempt,
                    name
                ),
            });
            debug!(
                instance = %self.shared.instance_id,
                target = %name,
                attempt,
                delay_ms,
                "retrying after failure"
            );
            if delay_ms > 0 {
                self.create_timer(now_ms + delay_ms, CancellationToken::new())
                    .await?;
            }
            attempt += 1;
        }
    }

    /// Suspend until virtual time reaches `fire_at_ms`. A time-shift that
    /// covers the due time fires the timer without the wall-clock wait;
    /// `cancel` aborts the wait with an error.
    pub async fn create_timer(
        &self,
        fire_at_ms: u64,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        self.await_resumed().await;
        let timer_id = self.shared.append(|id, ts| HistoryEvent::TimerCreated {
            event_id: id,
            timestamp_ms: ts,
            fire_at_ms,
        });
        let timer = Arc::new(OrchestrationTimer::new(
            fire_at_ms,
            self.shared.clock.now_ms(),
        ));
        self.shared.active_timers.lock().unwrap().push(timer.clone());
        let outcome = timer.wait(&cancel).await;
        self.shared
            .active_timers
            .lock()
            .unwrap()
            .retain(|t| !Arc::ptr_eq(t, &timer));
        match outcome {
            TimerOutcome::Fired => {
                self.shared.append(|id, ts| HistoryEvent::TimerFired {
                    event_id: id,
                    timestamp_ms: ts,
                    timer_id,
                });
                Ok(())
            }
            TimerOutcome::Canceled => Err(EngineError::activity(format!(
                "timer due at {fire_at_ms} was canceled before firing"
            ))),
        }
    }

    /// Wait for `raise_event` to deliver `name`, racing a timeout timer. A
    /// second wait on the same name replaces (and cancels) this one; a
    /// superseded or timed-out wait resolves to `default` when supplied and a
    /// timeout error otherwise.
    pub async fn wait_for_external_event(
        &self,
        name: impl Into<String>,
        timeout_ms: u64,
        default: Option<Value>,
    ) -> Result<Value, EngineError> {
        self.wait_for_external_event_with_cancellation(
            name,
            timeout_ms,
            default,
            CancellationToken::new(),
        )
        .await
    }

    /// `wait_for_external_event` with a caller cancellation token. Caller
    /// cancellation is an error; a timeout timer force-fired by a time-shift
    /// resolves through the normal timeout path.
    pub async fn wait_for_external_event_with_cancellation(
        &self,
        name: impl Into<String>,
        timeout_ms: u64,
        default: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, EngineError> {
        enum WaitOutcome {
            Settled(Option<Value>),
            TimedOut,
            CanceledByCaller,
        }

        let name = name.into();
        self.await_resumed().await;
        self.shared
            .append(|id, ts| HistoryEvent::ExternalEventWaiting {
                event_id: id,
                timestamp_ms: ts,
                name: name.clone(),
            });

        let token = Arc::new(WaitToken::new());
        if let Some(previous) = self
            .shared
            .event_tokens
            .lock()
            .unwrap()
            .insert(name.clone(), token.clone())
        {
            previous.cancel();
        }

        // the timeout timer joins the active set so a time-shift can expire
        // the wait
        let now_ms = self.shared.clock.now_ms();
        let timer = Arc::new(OrchestrationTimer::new(
            now_ms.saturating_add(timeout_ms),
            now_ms,
        ));
        self.shared.active_timers.lock().unwrap().push(timer.clone());
        let never = CancellationToken::new();
        let outcome = tokio::select! {
            biased;
            settled = token.wait() => WaitOutcome::Settled(settled),
            _ = timer.wait(&never) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::CanceledByCaller,
        };
        self.shared
            .active_timers
            .lock()
            .unwrap()
            .retain(|t| !Arc::ptr_eq(t, &timer));
        {
            // only remove the table entry if it is still ours; a replacing
            // waiter owns the slot now
            let mut tokens = self.shared.event_tokens.lock().unwrap();
            if let Some(current) = tokens.get(&name) {
                if Arc::ptr_eq(current, &token) {
                    tokens.remove(&name);
                }
            }
        }

        match outcome {
            WaitOutcome::Settled(Some(value)) => Ok(value),
            WaitOutcome::Settled(None) | WaitOutcome::TimedOut => match default {
                Some(value) => Ok(value),
                None => Err(EngineError::timeout(
                    format!("wait for external event `{name}`"),
                    timeout_ms,
                )),
            },
            WaitOutcome::CanceledByCaller => Err(EngineError::activity(format!(
                "wait for external event `{name}` was canceled"
            ))),
        }
    }

    /// Whether a wait is currently registered for `name`.
    pub fn is_waiting_for_event(&self, name: &str) -> bool {
        self.shared.is_waiting_for_event(name)
    }

    /// Delegates to the injectable handler; default is a 200 response. No
    /// real network I/O happens.
    pub async fn call_http(&self, request: DurableHttpRequest) -> DurableHttpResponse {
        self.await_resumed().await;
        self.shared.append(|id, ts| HistoryEvent::Generic {
            event_id: id,
            timestamp_ms: ts,
            message: format!("Calling HTTP {} {}", request.method, request.uri),
        });
        let handler = self.core.http_handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(&request),
            None => DurableHttpResponse::ok(),
        }
    }

    /// Fire-and-forget enqueue on the target entity, creating it lazily.
    pub fn signal_entity(&self, entity_id: &EntityId, operation: impl Into<String>, input: Value) {
        ClientCore::signal_entity(&self.core, entity_id, &operation.into(), input);
    }

    /// Fire-and-forget start of an independent top-level orchestration.
    /// Returns the new instance id.
    pub async fn start_new_orchestration(
        &self,
        name: impl Into<String>,
        instance_id: Option<String>,
        input: Value,
    ) -> String {
        ClientCore::start(&self.core, &name.into(), instance_id.as_deref(), input).await
    }

    /// Parks while the instance is suspended; every call primitive passes
    /// through here before doing work.
    async fn await_resumed(&self) {
        let mut rx = self.shared.subscribe_suspended();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Activity-scoped context: the activity's own deep copy of the input plus
/// bound services and a cancellation token tied to the owning instance.
#[derive(Clone)]
pub struct ActivityContext {
    pub(crate) instance_id: String,
    pub(crate) name: String,
    pub(crate) input: Value,
    pub(crate) services: crate::registry::ServiceProvider,
    pub(crate) cancellation: CancellationToken,
}

impl ActivityContext {
    /// Id of the orchestration instance that scheduled this activity.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn input_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_value(self.input.clone())
            .map_err(|e| EngineError::activity(format!("decode input: {e}")))
    }

    /// Resolve an injected dependency; missing bindings are
    /// `UnresolvedDependency` failures.
    pub fn service<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, EngineError> {
        self.services.get::<T>().ok_or_else(|| {
            EngineError::unresolved_dependency(&self.name, std::any::type_name::<T>())
        })
    }

    /// Canceled when the owning instance is terminated.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}
