use durosim::{
    ActivityContext, ActivityRegistry, CancellationToken, DurosimClient, HistoryEvent,
    OrchestrationContext, OrchestrationRegistry, RuntimeStatus,
};
use serde_json::{json, Value};

/// An orchestration touching every suspension primitive once.
fn busy_registries() -> (OrchestrationRegistry, ActivityRegistry) {
    let activities = ActivityRegistry::builder()
        .register("Step", |ctx: ActivityContext| async move {
            Ok(ctx.input().clone())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Busy", |ctx: OrchestrationContext, input: Value| async move {
            let step = ctx.call_activity("Step", input).await?;
            ctx.create_timer(ctx.current_time_ms() + 20, CancellationToken::new())
                .await?;
            let event = ctx.wait_for_external_event("Nudge", 60_000, None).await?;
            Ok(json!([step, event]))
        })
        .build();
    (orchestrations, activities)
}

#[tokio::test]
async fn event_ids_increase_strictly_and_the_log_brackets_the_run() {
    let (orchestrations, activities) = busy_registries();
    let client = DurosimClient::new(orchestrations, activities);

    let id = client.start("Busy", None, json!("s")).await;
    client
        .wait_for_expected_event(&id, "Nudge", None)
        .await
        .unwrap();
    client.raise_event(&id, "Nudge", json!("n")).await.unwrap();
    let status = client.wait_for_finish(&id, None).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    let ids: Vec<u64> = status.history.iter().map(|e| e.event_id()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids must increase: {ids:?}");
    assert_eq!(ids.first(), Some(&1));

    assert!(matches!(
        status.history.first(),
        Some(HistoryEvent::ExecutionStarted { .. })
    ));
    assert!(matches!(
        status.history.last(),
        Some(HistoryEvent::ExecutionCompleted {
            status: RuntimeStatus::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn completion_events_reference_their_scheduling_events() {
    let (orchestrations, activities) = busy_registries();
    let client = DurosimClient::new(orchestrations, activities);

    let id = client.start("Busy", None, json!("s")).await;
    client
        .wait_for_expected_event(&id, "Nudge", None)
        .await
        .unwrap();
    client.raise_event(&id, "Nudge", json!("n")).await.unwrap();
    let status = client.wait_for_finish(&id, None).await.unwrap();

    let scheduled = status
        .history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::TaskScheduled { event_id, name, .. } if name == "Step" => Some(*event_id),
            _ => None,
        })
        .expect("task scheduled");
    assert!(status.history.iter().any(|e| matches!(
        e,
        HistoryEvent::TaskCompleted { scheduled_id, .. } if *scheduled_id == scheduled
    )));

    let timer = status
        .history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::TimerCreated { event_id, .. } => Some(*event_id),
            _ => None,
        })
        .expect("timer created");
    assert!(status.history.iter().any(|e| matches!(
        e,
        HistoryEvent::TimerFired { timer_id, .. } if *timer_id == timer
    )));
}

#[tokio::test]
async fn status_snapshot_serializes_with_tagged_history() {
    let (orchestrations, activities) = busy_registries();
    let client = DurosimClient::new(orchestrations, activities);

    let id = client.start("Busy", None, json!("s")).await;
    client
        .wait_for_expected_event(&id, "Nudge", None)
        .await
        .unwrap();
    client.raise_event(&id, "Nudge", json!("n")).await.unwrap();
    let status = client.wait_for_finish(&id, None).await.unwrap();

    let value = serde_json::to_value(&status).unwrap();
    assert_eq!(value["instance_id"], json!(id));
    assert_eq!(value["name"], json!("Busy"));
    assert_eq!(value["runtime_status"], json!("Completed"));
    assert_eq!(value["history"][0]["event_type"], json!("ExecutionStarted"));
    assert_eq!(value["history"][0]["input"], json!("s"));
    assert!(value["history"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["event_type"] == json!("ExternalEventReceived") && e["data"] == json!("n")));
}

#[tokio::test]
async fn virtual_timestamps_advance_with_timeshift() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Sleeper", |ctx: OrchestrationContext, _input: Value| async move {
            ctx.create_timer(ctx.current_time_ms() + 60_000, CancellationToken::new())
                .await?;
            ctx.call_activity("Step", json!("after")).await
        })
        .build();
    let activities = ActivityRegistry::builder()
        .register("Step", |ctx: ActivityContext| async move {
            Ok(ctx.input().clone())
        })
        .build();
    let client = DurosimClient::new(orchestrations, activities);

    let id = client.start("Sleeper", None, Value::Null).await;
    for _ in 0..200 {
        if let Some(status) = client.get_status(&id).await {
            if status
                .history
                .iter()
                .any(|e| matches!(e, HistoryEvent::TimerCreated { .. }))
            {
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    client.timeshift(&id, 60_000).await.unwrap();
    let status = client.wait_for_finish(&id, None).await.unwrap();

    let created_ts = status
        .history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::TimerCreated { timestamp_ms, .. } => Some(*timestamp_ms),
            _ => None,
        })
        .unwrap();
    let scheduled_ts = status
        .history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::TaskScheduled { timestamp_ms, .. } => Some(*timestamp_ms),
            _ => None,
        })
        .unwrap();
    // the post-shift event carries the shifted virtual clock
    assert!(scheduled_ts >= created_ts + 60_000);
    assert_eq!(status.last_updated_time_ms, status.created_time_ms + 60_000);
}
