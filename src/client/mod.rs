//! Client surface: the instance/entity registry, control operations, status
//! snapshots, and polling-wait helpers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{EngineError, NotFoundKind};
use crate::history::{HistoryEvent, RuntimeStatus};
use crate::http::{CallHttpHandler, DurableHttpRequest, DurableHttpResponse};
use crate::registry::{ActivityRegistry, EntityRegistry, OrchestrationRegistry, ServiceProvider};
use crate::runtime::entity::{EntityId, EntityOperation, EntityRecord, EntityShared};
use crate::runtime::timers::wall_clock_ms;
use crate::runtime::{run_instance, InstanceShared};

/// Configuration for the client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Whether retry delays are honored in virtual time. When false (the
    /// default) every granted retry happens immediately, which keeps test
    /// runs fast.
    pub use_delays_for_retries: bool,
    /// Bound applied to every polling-wait helper when no explicit timeout is
    /// passed.
    pub default_wait_timeout_ms: u64,
    /// Polling interval for the wait helpers.
    pub poll_interval_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            use_delays_for_retries: false,
            default_wait_timeout_ms: 1_000,
            poll_interval_ms: 10,
        }
    }
}

/// Serializable snapshot of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationStatus {
    pub instance_id: String,
    pub name: String,
    pub runtime_status: RuntimeStatus,
    pub created_time_ms: u64,
    pub last_updated_time_ms: u64,
    pub input: Value,
    pub output: Option<Value>,
    pub custom_status: Option<Value>,
    pub history: Vec<HistoryEvent>,
}

/// Result of `read_entity_state`.
#[derive(Debug, Clone, Serialize)]
pub struct EntityStateResponse {
    pub entity_exists: bool,
    pub entity_state: Option<Value>,
}

pub(crate) struct InstanceRecord {
    pub shared: Arc<InstanceShared>,
    pub task: JoinHandle<()>,
}

/// State shared between the client and every running context.
pub(crate) struct ClientCore {
    pub orchestrations: OrchestrationRegistry,
    pub activities: ActivityRegistry,
    pub entities: EntityRegistry,
    pub services: ServiceProvider,
    pub options: ClientOptions,
    pub instances: Mutex<HashMap<String, InstanceRecord>>,
    pub entity_records: Mutex<HashMap<EntityId, EntityRecord>>,
    pub http_handler: Mutex<Option<CallHttpHandler>>,
}

impl ClientCore {
    /// Start (or restart-over) an instance and spawn its run task. A missing
    /// or empty id is assigned `instance-<count>`; an existing instance under
    /// the same id is terminated first.
    pub async fn start(
        core: &Arc<Self>,
        orchestration: &str,
        instance_id: Option<&str>,
        input: Value,
    ) -> String {
        let instance_id = match instance_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("instance-{}", core.instances.lock().unwrap().len()),
        };
        if let Some(existing) = core.instances.lock().unwrap().remove(&instance_id) {
            Self::terminate_record(existing);
        }
        let shared = Arc::new(InstanceShared::new(
            instance_id.clone(),
            None,
            orchestration.to_string(),
            input,
            wall_clock_ms(),
        ));
        let task = tokio::spawn(run_instance(core.clone(), shared.clone()));
        core.instances
            .lock()
            .unwrap()
            .insert(instance_id.clone(), InstanceRecord { shared, task });
        debug!(instance = %instance_id, orchestration, "started orchestration");
        instance_id
    }

    fn terminate_record(record: InstanceRecord) {
        record.task.abort();
        record.shared.cancellation.cancel();
        let already_terminal = {
            let mut status = record.shared.status.lock().unwrap();
            let terminal = status.is_terminal();
            if !terminal {
                *status = RuntimeStatus::Terminated;
            }
            terminal
        };
        if !already_terminal {
            record.shared.append(|id, ts| HistoryEvent::ExecutionCompleted {
                event_id: id,
                timestamp_ms: ts,
                status: RuntimeStatus::Terminated,
                output: None,
            });
        }
    }

    /// Fire-and-forget enqueue; creates the entity record and its run loop
    /// lazily.
    pub fn signal_entity(core: &Arc<Self>, entity_id: &EntityId, operation: &str, input: Value) {
        let mut records = core.entity_records.lock().unwrap();
        let record = records
            .entry(entity_id.clone())
            .or_insert_with(|| EntityRecord::spawn(core.clone(), entity_id.clone()));
        let _ = record.queue.send(EntityOperation {
            name: operation.to_string(),
            input,
        });
        debug!(entity = %entity_id, operation, "signaled entity");
    }

    fn instance(&self, instance_id: &str) -> Option<Arc<InstanceShared>> {
        self.instances
            .lock()
            .unwrap()
            .get(instance_id)
            .map(|r| r.shared.clone())
    }

    fn entity(&self, entity_id: &EntityId) -> Option<Arc<EntityShared>> {
        self.entity_records
            .lock()
            .unwrap()
            .get(entity_id)
            .map(|r| r.shared.clone())
    }
}

fn snapshot(shared: &InstanceShared) -> OrchestrationStatus {
    OrchestrationStatus {
        instance_id: shared.instance_id.clone(),
        name: shared.name.clone(),
        runtime_status: shared.status(),
        created_time_ms: shared.created_time_ms,
        last_updated_time_ms: shared.clock.now_ms(),
        input: shared.input.lock().unwrap().clone(),
        output: shared.output.lock().unwrap().clone(),
        custom_status: shared.custom_status.lock().unwrap().clone(),
        history: shared.history.lock().unwrap().clone(),
    }
}

/// In-process orchestration client and registry. Owns every instance and
/// entity; all test interaction goes through here.
pub struct DurosimClient {
    core: Arc<ClientCore>,
}

impl DurosimClient {
    pub fn new(orchestrations: OrchestrationRegistry, activities: ActivityRegistry) -> Self {
        Self::new_with(
            orchestrations,
            activities,
            EntityRegistry::default(),
            ServiceProvider::default(),
            ClientOptions::default(),
        )
    }

    pub fn new_with_options(
        orchestrations: OrchestrationRegistry,
        activities: ActivityRegistry,
        options: ClientOptions,
    ) -> Self {
        Self::new_with(
            orchestrations,
            activities,
            EntityRegistry::default(),
            ServiceProvider::default(),
            options,
        )
    }

    pub fn new_with(
        orchestrations: OrchestrationRegistry,
        activities: ActivityRegistry,
        entities: EntityRegistry,
        services: ServiceProvider,
        options: ClientOptions,
    ) -> Self {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
        Self {
            core: Arc::new(ClientCore {
                orchestrations,
                activities,
                entities,
                services,
                options,
                instances: Mutex::new(HashMap::new()),
                entity_records: Mutex::new(HashMap::new()),
                http_handler: Mutex::new(None),
            }),
        }
    }

    /// Start an orchestration. With no id the registry assigns
    /// `instance-<count>`; starting over an existing id implicitly terminates
    /// the prior instance.
    pub async fn start(
        &self,
        orchestration: &str,
        instance_id: Option<&str>,
        input: Value,
    ) -> String {
        ClientCore::start(&self.core, orchestration, instance_id, input).await
    }

    /// Start with a serde-serialized input.
    pub async fn start_typed<In: Serialize>(
        &self,
        orchestration: &str,
        instance_id: Option<&str>,
        input: &In,
    ) -> Result<String, EngineError> {
        let payload = serde_json::to_value(input)
            .map_err(|e| EngineError::activity(format!("encode input: {e}")))?;
        Ok(self.start(orchestration, instance_id, payload).await)
    }

    /// Deliver an external event. Unknown instance ids fail loudly; a known
    /// instance not waiting on the name is a silent no-op.
    pub async fn raise_event(
        &self,
        instance_id: &str,
        event_name: &str,
        data: Value,
    ) -> Result<(), EngineError> {
        let shared = self
            .core
            .instance(instance_id)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Instance, instance_id))?;
        shared.notify_external_event(event_name, data);
        Ok(())
    }

    /// Abort the instance and remove it from the registry. A no-op when the
    /// id is unknown.
    pub async fn terminate(&self, instance_id: &str) {
        if let Some(record) = self.core.instances.lock().unwrap().remove(instance_id) {
            ClientCore::terminate_record(record);
            debug!(instance = %instance_id, "terminated orchestration");
        }
    }

    /// Park the instance at its next call primitive until `resume`. No-op
    /// once the instance is terminal.
    pub async fn suspend(&self, instance_id: &str, reason: &str) {
        if let Some(shared) = self.core.instance(instance_id) {
            if shared.status().is_terminal() {
                return;
            }
            let reason = reason.to_string();
            shared.append(|id, ts| HistoryEvent::Generic {
                event_id: id,
                timestamp_ms: ts,
                message: format!("Execution suspended: {reason}"),
            });
            shared.set_suspended(true);
        }
    }

    pub async fn resume(&self, instance_id: &str, reason: &str) {
        if let Some(shared) = self.core.instance(instance_id) {
            if shared.status().is_terminal() {
                return;
            }
            let reason = reason.to_string();
            shared.append(|id, ts| HistoryEvent::Generic {
                event_id: id,
                timestamp_ms: ts,
                message: format!("Execution resumed: {reason}"),
            });
            shared.set_suspended(false);
        }
    }

    /// Re-run a Failed instance in place with its original input, appending a
    /// fresh execution segment to the same history. No-op for instances in
    /// any other state.
    pub async fn rewind(&self, instance_id: &str, reason: &str) {
        let mut instances = self.core.instances.lock().unwrap();
        if let Some(record) = instances.get_mut(instance_id) {
            if record.shared.status() != RuntimeStatus::Failed {
                return;
            }
            let reason = reason.to_string();
            record.shared.append(|id, ts| HistoryEvent::Generic {
                event_id: id,
                timestamp_ms: ts,
                message: format!("Execution rewound: {reason}"),
            });
            *record.shared.failure.lock().unwrap() = None;
            record.shared.set_status(RuntimeStatus::Pending);
            record.task = tokio::spawn(run_instance(self.core.clone(), record.shared.clone()));
            debug!(instance = %instance_id, "rewound orchestration");
        }
    }

    /// Terminate and start a fresh instance under the same id with the
    /// original input.
    pub async fn restart(&self, instance_id: &str) -> Result<String, EngineError> {
        let shared = self
            .core
            .instance(instance_id)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Instance, instance_id))?;
        let orchestration = shared.name.clone();
        let input = shared.input.lock().unwrap().clone();
        self.terminate(instance_id).await;
        Ok(self.start(&orchestration, Some(instance_id), input).await)
    }

    /// Advance the instance's virtual clock by `delta_ms`, force-firing any
    /// timer whose due time is reached and cascading into live
    /// sub-orchestrations.
    pub async fn timeshift(&self, instance_id: &str, delta_ms: u64) -> Result<(), EngineError> {
        let shared = self
            .core
            .instance(instance_id)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Instance, instance_id))?;
        shared.timeshift(delta_ms);
        debug!(instance = %instance_id, delta_ms, "timeshifted orchestration");
        Ok(())
    }

    pub async fn get_status(&self, instance_id: &str) -> Option<OrchestrationStatus> {
        self.core.instance(instance_id).map(|s| snapshot(&s))
    }

    pub async fn get_status_many(&self, instance_ids: &[&str]) -> Vec<Option<OrchestrationStatus>> {
        let mut result = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            result.push(self.get_status(id).await);
        }
        result
    }

    pub async fn list_instances(&self) -> Vec<OrchestrationStatus> {
        let instances = self.core.instances.lock().unwrap();
        instances.values().map(|r| snapshot(&r.shared)).collect()
    }

    /// Filter by creation-time window (inclusive) and status set.
    pub async fn query_instances(
        &self,
        created_from_ms: Option<u64>,
        created_to_ms: Option<u64>,
        statuses: &[RuntimeStatus],
    ) -> Vec<OrchestrationStatus> {
        let instances = self.core.instances.lock().unwrap();
        instances
            .values()
            .filter(|r| {
                let created = r.shared.created_time_ms;
                created_from_ms.map_or(true, |from| created >= from)
                    && created_to_ms.map_or(true, |to| created <= to)
                    && statuses.contains(&r.shared.status())
            })
            .map(|r| snapshot(&r.shared))
            .collect()
    }

    /// Replace the handler consulted by `call_http`.
    pub fn set_call_http_handler(
        &self,
        handler: impl Fn(&DurableHttpRequest) -> DurableHttpResponse + Send + Sync + 'static,
    ) {
        *self.core.http_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Poll until the instance reaches one of `statuses`.
    pub async fn wait_for_status(
        &self,
        instance_id: &str,
        statuses: &[RuntimeStatus],
        timeout_ms: Option<u64>,
    ) -> Result<OrchestrationStatus, EngineError> {
        let shared = self
            .core
            .instance(instance_id)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Instance, instance_id))?;
        self.poll_until("wait for orchestration status", timeout_ms, || {
            statuses.contains(&shared.status())
        })
        .await?;
        Ok(snapshot(&shared))
    }

    /// Poll until the instance finishes: Completed, Canceled, Failed, or
    /// Terminated.
    pub async fn wait_for_finish(
        &self,
        instance_id: &str,
        timeout_ms: Option<u64>,
    ) -> Result<OrchestrationStatus, EngineError> {
        self.wait_for_status(
            instance_id,
            &[
                RuntimeStatus::Completed,
                RuntimeStatus::Canceled,
                RuntimeStatus::Failed,
                RuntimeStatus::Terminated,
            ],
            timeout_ms,
        )
        .await
    }

    /// Poll until the instance's custom status matches `predicate`.
    pub async fn wait_for_custom_status(
        &self,
        instance_id: &str,
        predicate: impl Fn(Option<&Value>) -> bool,
        timeout_ms: Option<u64>,
    ) -> Result<OrchestrationStatus, EngineError> {
        let shared = self
            .core
            .instance(instance_id)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Instance, instance_id))?;
        self.poll_until("wait for custom status", timeout_ms, || {
            predicate(shared.custom_status.lock().unwrap().as_ref())
        })
        .await?;
        Ok(snapshot(&shared))
    }

    /// Poll until the instance is blocked waiting on external event
    /// `event_name`.
    pub async fn wait_for_expected_event(
        &self,
        instance_id: &str,
        event_name: &str,
        timeout_ms: Option<u64>,
    ) -> Result<(), EngineError> {
        let shared = self
            .core
            .instance(instance_id)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Instance, instance_id))?;
        self.poll_until("wait for expected event", timeout_ms, || {
            shared.is_waiting_for_event(event_name)
        })
        .await
    }

    /// Fire-and-forget enqueue on an entity, creating it lazily.
    pub async fn signal_entity(&self, entity_id: &EntityId, operation: &str, input: Value) {
        ClientCore::signal_entity(&self.core, entity_id, operation, input);
    }

    pub async fn read_entity_state(&self, entity_id: &EntityId) -> EntityStateResponse {
        match self.core.entity(entity_id) {
            Some(shared) => EntityStateResponse {
                entity_exists: true,
                entity_state: shared.state.lock().unwrap().clone(),
            },
            None => EntityStateResponse {
                entity_exists: false,
                entity_state: None,
            },
        }
    }

    /// Typed read; `Ok(None)` when the entity does not exist or holds no
    /// state yet.
    pub async fn read_entity_state_as<T: serde::de::DeserializeOwned>(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<T>, EngineError> {
        let response = self.read_entity_state(entity_id).await;
        match response.entity_state {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| EngineError::activity(format!("decode entity state: {e}"))),
        }
    }

    /// One-shot wait satisfied by the next operation named `operation_name`
    /// executed after registration.
    pub async fn wait_for_entity_operation(
        &self,
        entity_id: &EntityId,
        operation_name: &str,
        timeout_ms: Option<u64>,
    ) -> Result<(), EngineError> {
        let shared = self
            .core
            .entity(entity_id)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Entity, entity_id.to_string()))?;
        let mut rx = shared.executed.subscribe();
        let max_wait = timeout_ms.unwrap_or(self.core.options.default_wait_timeout_ms);
        let matched = tokio::time::timeout(Duration::from_millis(max_wait), async move {
            loop {
                match rx.recv().await {
                    Ok(name) if name == operation_name => return true,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await;
        match matched {
            Ok(true) => Ok(()),
            _ => Err(EngineError::timeout(
                format!("wait for entity operation `{operation_name}`"),
                max_wait,
            )),
        }
    }

    /// Resolves once the entity's state version advances strictly past its
    /// value at call time.
    pub async fn wait_for_entity_state_change(
        &self,
        entity_id: &EntityId,
        timeout_ms: Option<u64>,
    ) -> Result<(), EngineError> {
        let shared = self
            .core
            .entity(entity_id)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Entity, entity_id.to_string()))?;
        let mut rx = shared.version.subscribe();
        let version_was = *rx.borrow_and_update();
        let max_wait = timeout_ms.unwrap_or(self.core.options.default_wait_timeout_ms);
        let changed = tokio::time::timeout(Duration::from_millis(max_wait), async move {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if *rx.borrow_and_update() > version_was {
                    return true;
                }
            }
        })
        .await;
        match changed {
            Ok(true) => Ok(()),
            _ => Err(EngineError::timeout(
                "wait for entity state change",
                max_wait,
            )),
        }
    }

    /// Resolves once the entity's run loop observes its destruct flag and
    /// removes the record.
    pub async fn wait_for_entity_destruction(
        &self,
        entity_id: &EntityId,
        timeout_ms: Option<u64>,
    ) -> Result<(), EngineError> {
        let shared = self
            .core
            .entity(entity_id)
            .ok_or_else(|| EngineError::not_found(NotFoundKind::Entity, entity_id.to_string()))?;
        let mut rx = shared.destroyed.subscribe();
        let max_wait = timeout_ms.unwrap_or(self.core.options.default_wait_timeout_ms);
        let destroyed = tokio::time::timeout(Duration::from_millis(max_wait), async move {
            loop {
                if *rx.borrow_and_update() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow();
                }
            }
        })
        .await;
        match destroyed {
            Ok(true) => Ok(()),
            _ => Err(EngineError::timeout("wait for entity destruction", max_wait)),
        }
    }

    /// Abort every instance and entity task.
    pub fn shutdown(&self) {
        for (_, record) in self.core.instances.lock().unwrap().drain() {
            record.task.abort();
        }
        for (_, record) in self.core.entity_records.lock().unwrap().drain() {
            record.task.abort();
        }
    }

    async fn poll_until(
        &self,
        operation: &str,
        timeout_ms: Option<u64>,
        condition: impl Fn() -> bool,
    ) -> Result<(), EngineError> {
        let max_wait = timeout_ms.unwrap_or(self.core.options.default_wait_timeout_ms);
        let interval = self.core.options.poll_interval_ms.max(1);
        let mut waited: u64 = 0;
        loop {
            if condition() {
                return Ok(());
            }
            if waited >= max_wait {
                return Err(EngineError::timeout(operation, max_wait));
            }
            tokio::time::sleep(Duration::from_millis(interval)).await;
            waited += interval;
        }
    }
}
