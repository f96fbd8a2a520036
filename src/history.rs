use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of an orchestration instance.
///
/// `Pending` is the instant of creation before the body starts; `Running` is
/// entered once the body is invoked. The remaining states are terminal and
/// final; the only way out is an explicit restart, which creates a new
/// instance record under the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    Canceled,
}

impl RuntimeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuntimeStatus::Completed
                | RuntimeStatus::Failed
                | RuntimeStatus::Terminated
                | RuntimeStatus::Canceled
        )
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeStatus::Pending => "Pending",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::Completed => "Completed",
            RuntimeStatus::Failed => "Failed",
            RuntimeStatus::Terminated => "Terminated",
            RuntimeStatus::Canceled => "Canceled",
        };
        f.write_str(s)
    }
}

/// One entry in an instance's append-only history log.
///
/// Event ids are 1-based and strictly increasing within an instance.
/// Timestamps are the instance's *virtual* time in epoch milliseconds.
/// Completion-style events carry the `scheduled_id` of the event that opened
/// the operation. The log exists for observability and assertions only; it is
/// never re-consumed to reconstruct state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type")]
pub enum HistoryEvent {
    ExecutionStarted {
        event_id: u64,
        timestamp_ms: u64,
        name: String,
        input: Value,
    },
    TaskScheduled {
        event_id: u64,
        timestamp_ms: u64,
        name: String,
    },
    TaskCompleted {
        event_id: u64,
        timestamp_ms: u64,
        scheduled_id: u64,
        result: Value,
    },
    TaskFailed {
        event_id: u64,
        timestamp_ms: u64,
        scheduled_id: u64,
        reason: String,
        details: Option<String>,
    },
    TimerCreated {
        event_id: u64,
        timestamp_ms: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        event_id: u64,
        timestamp_ms: u64,
        timer_id: u64,
    },
    ExternalEventWaiting {
        event_id: u64,
        timestamp_ms: u64,
        name: String,
    },
    ExternalEventReceived {
        event_id: u64,
        timestamp_ms: u64,
        name: String,
        data: Value,
    },
    SubOrchestrationCreated {
        event_id: u64,
        timestamp_ms: u64,
        name: String,
        instance: String,
    },
    SubOrchestrationCompleted {
        event_id: u64,
        timestamp_ms: u64,
        scheduled_id: u64,
        result: Value,
    },
    SubOrchestrationFailed {
        event_id: u64,
        timestamp_ms: u64,
        scheduled_id: u64,
        reason: String,
        details: Option<String>,
    },
    ExecutionCompleted {
        event_id: u64,
        timestamp_ms: u64,
        status: RuntimeStatus,
        output: Option<Value>,
    },
    Generic {
        event_id: u64,
        timestamp_ms: u64,
        message: String,
    },
}

impl HistoryEvent {
    pub fn event_id(&self) -> u64 {
        match self {
            HistoryEvent::ExecutionStarted { event_id, .. }
            | HistoryEvent::TaskScheduled { event_id, .. }
            | HistoryEvent::TaskCompleted { event_id, .. }
            | HistoryEvent::TaskFailed { event_id, .. }
            | HistoryEvent::TimerCreated { event_id, .. }
            | HistoryEvent::TimerFired { event_id, .. }
            | HistoryEvent::ExternalEventWaiting { event_id, .. }
            | HistoryEvent::ExternalEventReceived { event_id, .. }
            | HistoryEvent::SubOrchestrationCreated { event_id, .. }
            | HistoryEvent::SubOrchestrationCompleted { event_id, .. }
            | HistoryEvent::SubOrchestrationFailed { event_id, .. }
            | HistoryEvent::ExecutionCompleted { event_id, .. }
            | HistoryEvent::Generic { event_id, .. } => *event_id,
        }
    }

    /// Stable kind tag, matching the serialized `event_type` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            HistoryEvent::ExecutionStarted { .. } => "ExecutionStarted",
            HistoryEvent::TaskScheduled { .. } => "TaskScheduled",
            HistoryEvent::TaskCompleted { .. } => "TaskCompleted",
            HistoryEvent::TaskFailed { .. } => "TaskFailed",
            HistoryEvent::TimerCreated { .. } => "TimerCreated",
            HistoryEvent::TimerFired { .. } => "TimerFired",
            HistoryEvent::ExternalEventWaiting { .. } => "ExternalEventWaiting",
            HistoryEvent::ExternalEventReceived { .. } => "ExternalEventReceived",
            HistoryEvent::SubOrchestrationCreated { .. } => "SubOrchestrationCreated",
            HistoryEvent::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            HistoryEvent::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            HistoryEvent::ExecutionCompleted { .. } => "ExecutionCompleted",
            HistoryEvent::Generic { .. } => "Generic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_event_type_tag() {
        let event = HistoryEvent::TaskScheduled {
            event_id: 2,
            timestamp_ms: 1000,
            name: "Greet".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], json!("TaskScheduled"));
        assert_eq!(value["event_id"], json!(2));
        assert_eq!(event.event_type(), "TaskScheduled");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RuntimeStatus::Pending.is_terminal());
        assert!(!RuntimeStatus::Running.is_terminal());
        for status in [
            RuntimeStatus::Completed,
            RuntimeStatus::Failed,
            RuntimeStatus::Terminated,
            RuntimeStatus::Canceled,
        ] {
            assert!(status.is_terminal());
        }
    }
}
