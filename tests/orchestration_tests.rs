use std::sync::atomic::{AtomicU32, Ordering};

use durosim::{
    ActivityContext, ActivityRegistry, DurosimClient, HistoryEvent, OrchestrationContext,
    OrchestrationRegistry, RuntimeStatus, ServiceProvider,
};
use serde_json::{json, Value};

fn event_types(history: &[HistoryEvent]) -> Vec<&'static str> {
    history.iter().map(|e| e.event_type()).collect()
}

fn hello_registries() -> (OrchestrationRegistry, ActivityRegistry) {
    let activities = ActivityRegistry::builder()
        .register("Greet", |ctx: ActivityContext| async move {
            let name: String = ctx.input_as()?;
            Ok(Value::String(format!("Hello, {name}!")))
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Hello", |ctx: OrchestrationContext, input: Value| async move {
            ctx.call_activity("Greet", input).await
        })
        .build();
    (orchestrations, activities)
}

#[tokio::test]
async fn single_activity_orchestration_completes() {
    let (orchestrations, activities) = hello_registries();
    let client = DurosimClient::new(orchestrations, activities);

    let id = client.start("Hello", None, json!("world")).await;
    let status = client.wait_for_finish(&id, None).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.output, Some(json!("Hello, world!")));
    assert_eq!(
        event_types(&status.history),
        vec![
            "ExecutionStarted",
            "TaskScheduled",
            "TaskCompleted",
            "ExecutionCompleted"
        ]
    );
}

#[tokio::test]
async fn status_after_start_is_never_completed() {
    let (orchestrations, activities) = hello_registries();
    let client = DurosimClient::new(orchestrations, activities);

    let id = client.start("Hello", None, json!("early")).await;
    let status = client.get_status(&id).await.unwrap();

    assert!(
        matches!(
            status.runtime_status,
            RuntimeStatus::Pending | RuntimeStatus::Running
        ),
        "expected Pending or Running, got {:?}",
        status.runtime_status
    );
}

#[tokio::test]
async fn uncaught_activity_failure_fails_the_instance() {
    let activities = ActivityRegistry::builder()
        .register("Explode", |_ctx: ActivityContext| async move {
            Err("boom".into())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Fragile", |ctx: OrchestrationContext, input: Value| async move {
            ctx.call_activity("Explode", input).await
        })
        .build();
    let client = DurosimClient::new(orchestrations, activities);

    let id = client.start("Fragile", None, Value::Null).await;
    let status = client.wait_for_finish(&id, None).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Failed);
    assert_eq!(status.output, None);
    assert!(status
        .history
        .iter()
        .any(|e| matches!(e, HistoryEvent::TaskFailed { reason, .. } if reason.contains("boom"))));
    assert!(matches!(
        status.history.last(),
        Some(HistoryEvent::ExecutionCompleted {
            status: RuntimeStatus::Failed,
            ..
        })
    ));
}

#[tokio::test]
async fn unknown_orchestration_name_fails_on_first_occurrence() {
    let client = DurosimClient::new(
        OrchestrationRegistry::default(),
        ActivityRegistry::default(),
    );

    let id = client.start("DoesNotExist", None, Value::Null).await;
    let status = client.wait_for_finish(&id, None).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Failed);
    assert!(status
        .history
        .iter()
        .any(|e| matches!(e, HistoryEvent::TaskFailed { reason, .. } if reason.contains("DoesNotExist"))));
}

#[tokio::test]
async fn unknown_activity_failure_is_catchable() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Caught", |ctx: OrchestrationContext, _input: Value| async move {
            match ctx.call_activity("Missing", Value::Null).await {
                Ok(value) => Ok(value),
                Err(_) => Ok(json!("fallback")),
            }
        })
        .build();
    let client = DurosimClient::new(orchestrations, ActivityRegistry::default());

    let id = client.start("Caught", None, Value::Null).await;
    let status = client.wait_for_finish(&id, None).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.output, Some(json!("fallback")));
}

#[tokio::test]
async fn activity_input_is_deep_copied_both_ways() {
    let activities = ActivityRegistry::builder()
        .register("Mutate", |ctx: ActivityContext| async move {
            let mut copy = ctx.input().clone();
            copy["items"]
                .as_array_mut()
                .ok_or("items missing")?
                .push(json!(4));
            copy["mutated"] = json!(true);
            Ok(copy)
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Isolated", |ctx: OrchestrationContext, input: Value| async move {
            let mutated = ctx.call_activity("Mutate", input.clone()).await?;
            // the orchestration's own copy is untouched by the activity
            if ctx.input() != input {
                return Err("orchestration input changed under us".into());
            }
            Ok(mutated)
        })
        .build();
    let client = DurosimClient::new(orchestrations, activities);

    let original = json!({"items": [1, 2, 3]});
    let id = client.start("Isolated", None, original.clone()).await;
    let status = client.wait_for_finish(&id, None).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.input, original);
    assert_eq!(
        status.output,
        Some(json!({"items": [1, 2, 3, 4], "mutated": true}))
    );
}

struct GreetingStyle {
    punctuation: &'static str,
}

struct Hits {
    count: AtomicU32,
}

#[tokio::test]
async fn activities_resolve_injected_services() {
    let activities = ActivityRegistry::builder()
        .register("StyledGreet", |ctx: ActivityContext| async move {
            let style = ctx.service::<GreetingStyle>()?;
            let hits = ctx.service::<Hits>()?;
            hits.count.fetch_add(1, Ordering::SeqCst);
            let name: String = ctx.input_as()?;
            Ok(Value::String(format!("Hi {name}{}", style.punctuation)))
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Styled", |ctx: OrchestrationContext, input: Value| async move {
            ctx.call_activity("StyledGreet", input).await
        })
        .build();
    let services = ServiceProvider::builder()
        .provide(GreetingStyle { punctuation: "!!" })
        .provide(Hits {
            count: AtomicU32::new(0),
        })
        .build();
    let client = DurosimClient::new_with(
        orchestrations,
        activities,
        durosim::EntityRegistry::default(),
        services,
        durosim::ClientOptions::default(),
    );

    let id = client.start("Styled", None, json!("Ada")).await;
    let status = client.wait_for_finish(&id, None).await.unwrap();

    assert_eq!(status.output, Some(json!("Hi Ada!!")));
}

#[tokio::test]
async fn missing_service_is_an_unresolved_dependency_failure() {
    let activities = ActivityRegistry::builder()
        .register("NeedsStyle", |ctx: ActivityContext| async move {
            let style = ctx.service::<GreetingStyle>()?;
            Ok(Value::String(style.punctuation.to_string()))
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Unbound", |ctx: OrchestrationContext, input: Value| async move {
            ctx.call_activity("NeedsStyle", input).await
        })
        .build();
    let client = DurosimClient::new(orchestrations, activities);

    let id = client.start("Unbound", None, Value::Null).await;
    let status = client.wait_for_finish(&id, None).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Failed);
    assert!(status
        .history
        .iter()
        .any(|e| matches!(e, HistoryEvent::TaskFailed { reason, .. } if reason.contains("unable to bind"))));
}

#[tokio::test]
async fn omitted_instance_ids_are_assigned_sequentially() {
    let (orchestrations, activities) = hello_registries();
    let client = DurosimClient::new(orchestrations, activities);

    let first = client.start("Hello", None, json!("a")).await;
    let second = client.start("Hello", None, json!("b")).await;

    assert_eq!(first, "instance-0");
    assert_eq!(second, "instance-1");
}

#[tokio::test]
async fn starting_over_an_existing_id_replaces_the_instance() {
    let activities = ActivityRegistry::builder()
        .register("Greet", |ctx: ActivityContext| async move {
            Ok(ctx.input().clone())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("WaitsForever", |ctx: OrchestrationContext, _input: Value| async move {
            ctx.wait_for_external_event("Never", 600_000, None).await
        })
        .register("Quick", |ctx: OrchestrationContext, input: Value| async move {
            ctx.call_activity("Greet", input).await
        })
        .build();
    let client = DurosimClient::new(orchestrations, activities);

    let id = client.start("WaitsForever", Some("dup"), Value::Null).await;
    client
        .wait_for_expected_event(&id, "Never", None)
        .await
        .unwrap();

    let id = client.start("Quick", Some("dup"), json!("second")).await;
    let status = client.wait_for_finish(&id, None).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.output, Some(json!("second")));
    assert_eq!(client.list_instances().await.len(), 1);
}
