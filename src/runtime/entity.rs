//! Entity actors: addressable, stateful, single-threaded operation queues.
//!
//! All external access to an entity enqueues onto its private queue; state is
//! mutated only inside the entity's own run loop. Condition waits observe the
//! loop's notifications (operation broadcast, state-version watch,
//! destruction watch) rather than entity state directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::client::ClientCore;
use crate::error::EngineError;
use crate::registry::EntityHandler;

/// Address of one entity: logical name plus key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub name: String,
    pub key: String,
}

impl EntityId {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.key)
    }
}

/// One queued operation.
pub(crate) struct EntityOperation {
    pub name: String,
    pub input: Value,
}

/// State shared between the run loop and observers. Only the run loop writes
/// the state and the notification channels.
pub(crate) struct EntityShared {
    pub id: EntityId,
    pub state: Mutex<Option<Value>>,
    pub version: watch::Sender<u64>,
    pub destroyed: watch::Sender<bool>,
    pub executed: broadcast::Sender<String>,
}

impl EntityShared {
    fn new(id: EntityId) -> Self {
        let (version, _) = watch::channel(0u64);
        let (destroyed, _) = watch::channel(false);
        let (executed, _) = broadcast::channel(64);
        Self {
            id,
            state: Mutex::new(None),
            version,
            destroyed,
            executed,
        }
    }
}

/// Map entry owned by the client core.
pub(crate) struct EntityRecord {
    pub shared: Arc<EntityShared>,
    pub queue: mpsc::UnboundedSender<EntityOperation>,
    pub task: JoinHandle<()>,
}

impl EntityRecord {
    /// Create the record and start its run loop.
    pub fn spawn(core: Arc<ClientCore>, id: EntityId) -> Self {
        let shared = Arc::new(EntityShared::new(id));
        let (queue, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_entity(core, shared.clone(), rx));
        Self {
            shared,
            queue,
            task,
        }
    }
}

/// Single-threaded run loop: one operation at a time, in arrival order.
async fn run_entity(
    core: Arc<ClientCore>,
    shared: Arc<EntityShared>,
    mut rx: mpsc::UnboundedReceiver<EntityOperation>,
) {
    let mut newly_constructed = true;
    while let Some(op) = rx.recv().await {
        let destruct = Arc::new(AtomicBool::new(false));
        match core.entities.get(&op.name) {
            Some(handler) => {
                let ctx = EntityContext {
                    core: core.clone(),
                    shared: shared.clone(),
                    operation_name: op.name.clone(),
                    input: op.input,
                    newly_constructed,
                    destruct: destruct.clone(),
                };
                if let Err(e) = handler.invoke(ctx).await {
                    error!(entity = %shared.id, operation = %op.name, error = %e, "entity operation failed");
                }
            }
            None => {
                error!(entity = %shared.id, operation = %op.name, "unregistered entity operation");
                continue;
            }
        }
        newly_constructed = false;
        shared.version.send_modify(|v| *v += 1);
        let _ = shared.executed.send(op.name.clone());
        debug!(entity = %shared.id, operation = %op.name, "executed entity operation");

        if destruct.load(Ordering::SeqCst) {
            core.entity_records.lock().unwrap().remove(&shared.id);
            let _ = shared.destroyed.send(true);
            debug!(entity = %shared.id, "entity destroyed");
            break;
        }
    }
}

/// Entity-scoped context handed to operation handlers.
pub struct EntityContext {
    core: Arc<ClientCore>,
    shared: Arc<EntityShared>,
    operation_name: String,
    input: Value,
    newly_constructed: bool,
    destruct: Arc<AtomicBool>,
}

impl EntityContext {
    pub fn entity_id(&self) -> &EntityId {
        &self.shared.id
    }

    pub fn entity_name(&self) -> &str {
        &self.shared.id.name
    }

    pub fn entity_key(&self) -> &str {
        &self.shared.id.key
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// True for the first operation after the entity record was created.
    pub fn is_newly_constructed(&self) -> bool {
        self.newly_constructed
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn input_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_value(self.input.clone())
            .map_err(|e| EngineError::activity(format!("decode input: {e}")))
    }

    pub fn state(&self) -> Option<Value> {
        self.shared.state.lock().unwrap().clone()
    }

    pub fn state_as<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>, EngineError> {
        match self.state() {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| EngineError::activity(format!("decode state: {e}"))),
        }
    }

    pub fn set_state(&self, state: Value) {
        *self.shared.state.lock().unwrap() = Some(state);
    }

    /// Enqueue an operation on another entity (or this one); never executes
    /// inline.
    pub fn signal_entity(&self, target: &EntityId, operation: impl Into<String>, input: Value) {
        ClientCore::signal_entity(&self.core, target, &operation.into(), input);
    }

    /// Remove this entity after the current operation completes.
    pub fn destruct_on_exit(&self) {
        self.destruct.store(true, Ordering::SeqCst);
    }

    /// Resolve an injected dependency; missing bindings are
    /// `UnresolvedDependency` failures.
    pub fn service<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, EngineError> {
        self.core.services.get::<T>().ok_or_else(|| {
            EngineError::unresolved_dependency(&self.operation_name, std::any::type_name::<T>())
        })
    }
}
