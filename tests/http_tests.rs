use durosim::{
    ActivityRegistry, DurableHttpRequest, DurableHttpResponse, DurosimClient, HistoryEvent,
    OrchestrationContext, OrchestrationRegistry, RuntimeStatus,
};
use http::StatusCode;
use serde_json::{json, Value};

fn http_orchestration() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Fetch", |ctx: OrchestrationContext, _input: Value| async move {
            let response = ctx
                .call_http(DurableHttpRequest::get("https://example.test/status"))
                .await;
            Ok(json!({
                "status": response.status_code.as_u16(),
                "content": response.content,
            }))
        })
        .build()
}

#[tokio::test]
async fn call_http_defaults_to_a_200_response() {
    let client = DurosimClient::new(http_orchestration(), ActivityRegistry::default());

    let id = client.start("Fetch", None, Value::Null).await;
    let status = client.wait_for_finish(&id, None).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.output, Some(json!({"status": 200, "content": null})));
}

#[tokio::test]
async fn installed_handler_sees_the_request_and_its_response_is_returned() {
    let client = DurosimClient::new(http_orchestration(), ActivityRegistry::default());
    client.set_call_http_handler(|request| {
        assert_eq!(request.method, http::Method::GET);
        assert_eq!(request.uri, "https://example.test/status");
        DurableHttpResponse::new(StatusCode::IM_A_TEAPOT).with_content("short and stout")
    });

    let id = client.start("Fetch", None, Value::Null).await;
    let status = client.wait_for_finish(&id, None).await.unwrap();

    assert_eq!(
        status.output,
        Some(json!({"status": 418, "content": "short and stout"}))
    );
    assert!(status.history.iter().any(|e| matches!(
        e,
        HistoryEvent::Generic { message, .. } if message.contains("Calling HTTP GET")
    )));
}
