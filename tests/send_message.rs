//! `message/send` behavior: local completion, continuation, clarification
//! and resume, error surfaces, and history trimming.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_broker, test_config, SequenceLlm};
use fleetlink::error::BrokerError;
use fleetlink::llm::{RouteAction, RouteAnalysis};
use fleetlink::server::RequestHandler;
use fleetlink::types::{
    GetTaskParams, Message, Role, SendMessageConfiguration, SendMessageParams,
    SendMessageResponse, TaskState,
};

fn blocking_send(text: &str) -> SendMessageParams {
    SendMessageParams {
        message: Message::user_text(text),
        configuration: Some(SendMessageConfiguration {
            blocking: Some(true),
            ..Default::default()
        }),
        metadata: None,
    }
}

#[tokio::test]
async fn simple_send_completes_with_agent_reply() {
    let broker = test_broker(test_config(), None).await;
    let handler = broker.handler();

    // No device matches "ping"; the broker answers locally within the
    // blocking deadline.
    let response = tokio::time::timeout(
        Duration::from_secs(2),
        handler.on_message_send(blocking_send("ping")),
    )
    .await
    .expect("within deadline")
    .expect("send ok");

    let task = match response {
        SendMessageResponse::Task(task) => task,
        other => panic!("expected task, got {:?}", other),
    };
    assert_eq!(task.status.state, TaskState::Completed);

    let history = task.history.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Agent);
    assert!(!history[1].text_content().is_empty());
}

#[tokio::test]
async fn get_unknown_task_is_task_not_found() {
    let broker = test_broker(test_config(), None).await;
    let err = broker
        .handler()
        .on_get_task(GetTaskParams {
            id: "missing".to_string(),
            history_length: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::TaskNotFound { .. }));
}

#[tokio::test]
async fn send_referencing_unknown_task_is_task_not_found() {
    let broker = test_broker(test_config(), None).await;
    let mut message = Message::user_text("continue please");
    message.task_id = Some("missing".to_string());

    let err = broker
        .handler()
        .on_message_send(SendMessageParams {
            message,
            configuration: None,
            metadata: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::TaskNotFound { .. }));
}

#[tokio::test]
async fn send_to_terminal_task_is_rejected_as_closed() {
    let broker = test_broker(test_config(), None).await;
    let handler = broker.handler();

    let response = handler.on_message_send(blocking_send("ping")).await.unwrap();
    let task = match response {
        SendMessageResponse::Task(task) => task,
        other => panic!("expected task, got {:?}", other),
    };
    assert_eq!(task.status.state, TaskState::Completed);

    let mut follow_up = Message::user_text("one more thing");
    follow_up.task_id = Some(task.id.clone());
    let err = handler
        .on_message_send(SendMessageParams {
            message: follow_up,
            configuration: None,
            metadata: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::TaskNotCancelable { .. }));
}

#[tokio::test]
async fn low_confidence_parks_then_follow_up_resumes() {
    // First analysis: shaky device pick → clarification. Second: confident
    // local answer → completion.
    let llm = Arc::new(SequenceLlm::new(vec![
        RouteAnalysis {
            action: RouteAction::Device,
            target: Some("cam-1".to_string()),
            tool: None,
            arguments: None,
            confidence: 0.2,
            rationale: "unsure".to_string(),
        },
        RouteAnalysis {
            action: RouteAction::Local,
            target: None,
            tool: None,
            arguments: Some(serde_json::json!({"reply": "All set."})),
            confidence: 0.95,
            rationale: String::new(),
        },
    ]));
    let broker = test_broker(test_config(), Some(llm)).await;
    let handler = broker.handler();

    let response = handler
        .on_message_send(blocking_send("do the thing"))
        .await
        .unwrap();
    let task = match response {
        SendMessageResponse::Task(task) => task,
        other => panic!("expected task, got {:?}", other),
    };
    assert_eq!(task.status.state, TaskState::InputRequired);
    let question = task.status.message.as_ref().expect("clarification note");
    assert!(!question.text_content().is_empty());

    let mut follow_up = Message::user_text("I meant: just acknowledge");
    follow_up.task_id = Some(task.id.clone());
    let response = handler
        .on_message_send(SendMessageParams {
            message: follow_up,
            configuration: Some(SendMessageConfiguration {
                blocking: Some(true),
                ..Default::default()
            }),
            metadata: None,
        })
        .await
        .unwrap();

    let resumed = match response {
        SendMessageResponse::Task(task) => task,
        other => panic!("expected task, got {:?}", other),
    };
    assert_eq!(resumed.status.state, TaskState::Completed);
    assert_eq!(
        resumed.status.message.expect("reply").text_content(),
        "All set."
    );
}

#[tokio::test]
async fn history_length_trims_the_response() {
    let broker = test_broker(test_config(), None).await;
    let handler = broker.handler();

    let mut params = blocking_send("ping");
    params.configuration.as_mut().unwrap().history_length = Some(1);
    let response = handler.on_message_send(params).await.unwrap();

    let task = match response {
        SendMessageResponse::Task(task) => task,
        other => panic!("expected task, got {:?}", other),
    };
    let history = task.history.expect("history");
    assert_eq!(history.len(), 1);
    // The tail survives: the agent's reply.
    assert_eq!(history[0].role, Role::Agent);
}

#[tokio::test]
async fn unproducible_output_modes_are_refused_without_a_task() {
    let broker = test_broker(test_config(), None).await;

    let mut params = blocking_send("ping");
    params.configuration.as_mut().unwrap().accepted_output_modes =
        Some(vec!["video/mp4".to_string()]);
    let err = broker.handler().on_message_send(params).await.unwrap_err();
    assert!(matches!(err, BrokerError::ContentTypeNotSupported { .. }));

    // No task was allocated for the refused request.
    let tasks = broker
        .tasks()
        .list(&fleetlink::types::ListTasksParams::default())
        .await
        .unwrap();
    assert!(tasks.tasks.is_empty());

    // Wildcards are fine.
    let mut params = blocking_send("ping");
    params.configuration.as_mut().unwrap().accepted_output_modes =
        Some(vec!["*/*".to_string()]);
    assert!(broker.handler().on_message_send(params).await.is_ok());
}

#[tokio::test]
async fn rejection_ends_in_rejected_state() {
    let llm = Arc::new(SequenceLlm::new(vec![RouteAnalysis {
        action: RouteAction::Reject,
        target: None,
        tool: None,
        arguments: None,
        confidence: 0.9,
        rationale: "out of scope".to_string(),
    }]));
    let broker = test_broker(test_config(), Some(llm)).await;

    let response = broker
        .handler()
        .on_message_send(blocking_send("do something forbidden"))
        .await
        .unwrap();
    let task = match response {
        SendMessageResponse::Task(task) => task,
        other => panic!("expected task, got {:?}", other),
    };
    assert_eq!(task.status.state, TaskState::Rejected);
    assert!(task
        .status
        .message
        .expect("rejection note")
        .text_content()
        .contains("out of scope"));
}
