//! Push notification delivery: event envelopes, auth headers, delivery
//! ids, 4xx drop semantics, and 5xx retries.

mod common;

use std::time::Duration;

use common::{test_broker, test_config, PushReceiver};
use fleetlink::server::RequestHandler;
use fleetlink::types::{
    Message, PushAuthentication, PushNotificationConfig, SendMessageConfiguration,
    SendMessageParams, SendMessageResponse, TaskState,
};

async fn send_with_push(
    broker: &std::sync::Arc<fleetlink::broker::Broker>,
    url: &str,
    auth: Option<PushAuthentication>,
) -> fleetlink::types::Task {
    let response = broker
        .handler()
        .on_message_send(SendMessageParams {
            message: Message::user_text("ping"),
            configuration: Some(SendMessageConfiguration {
                blocking: Some(true),
                push_notification_config: Some(PushNotificationConfig {
                    id: None,
                    url: url.to_string(),
                    authentication: auth,
                }),
                ..Default::default()
            }),
            metadata: None,
        })
        .await
        .unwrap();
    match response {
        SendMessageResponse::Task(task) => task,
        other => panic!("expected task, got {:?}", other),
    }
}

#[tokio::test]
async fn delivers_status_updates_with_delivery_id_and_auth() {
    let broker = test_broker(test_config(), None).await;
    let receiver = PushReceiver::spawn(vec![200]).await;

    let task = send_with_push(
        &broker,
        &receiver.url,
        Some(PushAuthentication::Bearer {
            token: "secret-token".to_string(),
        }),
    )
    .await;
    assert_eq!(task.status.state, TaskState::Completed);

    // Working + Completed status updates reach the target, in order.
    let captured = receiver.wait_for(2, Duration::from_secs(2)).await;
    assert!(captured.len() >= 2);

    let states: Vec<&str> = captured
        .iter()
        .filter(|c| c.body["kind"] == "status-update")
        .filter_map(|c| c.body["status"]["state"].as_str())
        .collect();
    assert_eq!(states.first().copied(), Some("working"));
    assert_eq!(states.last().copied(), Some("completed"));

    for push in &captured {
        assert!(push.delivery_id.is_some());
        assert_eq!(push.authorization.as_deref(), Some("Bearer secret-token"));
        assert_eq!(push.body["taskId"].as_str(), Some(task.id.as_str()));
    }
}

#[tokio::test]
async fn client_errors_drop_without_retry() {
    let broker = test_broker(test_config(), None).await;
    let receiver = PushReceiver::spawn(vec![404]).await;

    send_with_push(&broker, &receiver.url, None).await;

    // Two events (working, completed), one attempt each, no retries.
    let captured = receiver.wait_for(2, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = receiver.captured().await;
    assert_eq!(captured.len(), after.len());

    let mut delivery_ids: Vec<String> =
        after.iter().filter_map(|c| c.delivery_id.clone()).collect();
    let total = delivery_ids.len();
    delivery_ids.dedup();
    assert_eq!(delivery_ids.len(), total, "a 4xx delivery was retried");
}

#[tokio::test]
async fn server_errors_are_retried_with_the_same_delivery_id() {
    let broker = test_broker(test_config(), None).await;
    // First attempt 500, everything after succeeds. Backoff base is 0 in
    // the test config, so the retry lands immediately.
    let receiver = PushReceiver::spawn(vec![500, 200]).await;

    send_with_push(&broker, &receiver.url, None).await;

    // working (fails once, retried) + completed = at least 3 requests.
    let captured = receiver.wait_for(3, Duration::from_secs(3)).await;
    assert!(captured.len() >= 3);

    // The first two requests are the same delivery retried.
    assert_eq!(captured[0].delivery_id, captured[1].delivery_id);
    assert_eq!(captured[0].body["status"]["state"].as_str(), Some("working"));
    assert_eq!(captured[1].body["status"]["state"].as_str(), Some("working"));
}
