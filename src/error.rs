use thiserror::Error;

/// What category of name failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Orchestration,
    Activity,
    Entity,
    Instance,
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotFoundKind::Orchestration => "orchestration",
            NotFoundKind::Activity => "activity",
            NotFoundKind::Entity => "entity",
            NotFoundKind::Instance => "instance",
        };
        f.write_str(s)
    }
}

/// Failure taxonomy for the simulator.
///
/// `Activity` failures propagate from activity and sub-orchestration bodies and
/// are catchable by the calling orchestration; uncaught, they become the
/// instance's terminal `Failed` status. `Timeout` is raised by every bounded
/// wait. `NotFound` and `UnresolvedDependency` are immediate and never retried
/// by the retry wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("{message}")]
    Activity {
        message: String,
        details: Option<String>,
    },

    #[error("{operation} exceeded max wait time of {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("no {kind} named `{name}` is registered or known")]
    NotFound { kind: NotFoundKind, name: String },

    #[error("unable to bind dependency `{dependency}` required by `{function}`")]
    UnresolvedDependency { function: String, dependency: String },
}

impl EngineError {
    /// An activity-style failure with just a message.
    pub fn activity(message: impl Into<String>) -> Self {
        EngineError::Activity {
            message: message.into(),
            details: None,
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        EngineError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn not_found(kind: NotFoundKind, name: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn unresolved_dependency(function: impl Into<String>, dependency: impl Into<String>) -> Self {
        EngineError::UnresolvedDependency {
            function: function.into(),
            dependency: dependency.into(),
        }
    }

    /// Whether the retry wrapper may retry after this failure.
    /// Missing names and unbindable dependencies never heal on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Activity { .. } | EngineError::Timeout { .. }
        )
    }

    /// Secondary detail payload, recorded alongside the reason in history.
    pub fn details(&self) -> Option<String> {
        match self {
            EngineError::Activity { details, .. } => details.clone(),
            _ => None,
        }
    }
}

/// Handler bodies report failures as plain strings; they surface as
/// activity-style failures.
impl From<String> for EngineError {
    fn from(message: String) -> Self {
        EngineError::Activity {
            message,
            details: None,
        }
    }
}

impl From<&str> for EngineError {
    fn from(message: &str) -> Self {
        message.to_string().into()
    }
}
