//! durosim — an in-process simulator of a durable-workflow execution engine.
//!
//! Orchestration bodies run exactly once as tokio tasks, suspending
//! cooperatively at the call primitives (activities, sub-orchestrations,
//! timers, external events, retries). Each instance carries its own virtual
//! clock: `timeshift` advances it and force-fires due timers without real
//! wall-clock delay, which keeps time-dependent orchestration tests fast and
//! deterministic. There is no replay, no persistence, and no distributed
//! coordination — the simulator exists to unit-test orchestration logic.
//!
//! ```no_run
//! use durosim::{ActivityRegistry, DurosimClient, OrchestrationRegistry};
//! use serde_json::{json, Value};
//!
//! # async fn demo() {
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |ctx: durosim::ActivityContext| async move {
//!         let name: String = ctx.input_as()?;
//!         Ok(Value::String(format!("Hello, {name}!")))
//!     })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("Hello", |ctx: durosim::OrchestrationContext, input: Value| async move {
//!         ctx.call_activity("Greet", input).await
//!     })
//!     .build();
//!
//! let client = DurosimClient::new(orchestrations, activities);
//! let id = client.start("Hello", None, json!("world")).await;
//! let status = client.wait_for_finish(&id, None).await.unwrap();
//! assert_eq!(status.output, Some(json!("Hello, world!")));
//! # }
//! ```

pub mod client;
pub mod error;
pub mod history;
pub mod http;
pub mod registry;
pub mod retry;
pub mod runtime;

pub use client::{ClientOptions, DurosimClient, EntityStateResponse, OrchestrationStatus};
pub use error::{EngineError, NotFoundKind};
pub use history::{HistoryEvent, RuntimeStatus};
pub use http::{DurableHttpRequest, DurableHttpResponse};
pub use registry::{
    ActivityRegistry, EntityRegistry, OrchestrationRegistry, ServiceProvider,
};
pub use retry::RetryPolicy;
pub use runtime::context::{ActivityContext, OrchestrationContext};
pub use runtime::entity::{EntityContext, EntityId};

/// Re-exported for timer and wait cancellation.
pub use tokio_util::sync::CancellationToken;
