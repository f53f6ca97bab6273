//! Device-bound routing: the keyword fast path drives a tool invocation,
//! tool results become artifacts, and runtime failures carry their kind
//! into the terminal status.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    camera_spec, capture_tool, register_camera, spawn_device, test_broker, test_config,
    DeviceBehavior,
};
use fleetlink::device::{ChannelDevicePort, ToolDescriptor};
use fleetlink::server::RequestHandler;
use fleetlink::types::{
    Message, Part, SendMessageConfiguration, SendMessageParams, SendMessageResponse, StreamEvent,
    TaskState,
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
async fn photo_request_invokes_the_camera_once() {
    let broker = test_broker(test_config(), None).await;
    let device = register_camera(&broker, "cam-1", DeviceBehavior::ReplyFile).await;

    let response = broker
        .handler()
        .on_message_send(blocking_send("take a photo"))
        .await
        .unwrap();
    let task = match response {
        SendMessageResponse::Task(task) => task,
        other => panic!("expected task, got {:?}", other),
    };

    assert_eq!(task.status.state, TaskState::Completed);
    assert_eq!(device.invocation_count(), 1);

    let artifacts = task.artifacts.expect("artifacts");
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0]
        .parts
        .iter()
        .any(|p| matches!(p, Part::File { .. })));
}

#[tokio::test]
async fn device_route_streams_working_artifact_completed() {
    let broker = test_broker(test_config(), None).await;
    let _device = register_camera(&broker, "cam-1", DeviceBehavior::ReplyFile).await;

    let mut rx = broker
        .handler()
        .on_message_send_stream(SendMessageParams {
            message: Message::user_text("take a photo"),
            configuration: None,
            metadata: None,
        })
        .await
        .unwrap();

    let mut states = Vec::new();
    let mut saw_artifact = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within deadline");
        match event {
            Ok(StreamEvent::StatusUpdate(update)) => {
                states.push(update.status.state);
                if update.r#final {
                    break;
                }
            }
            Ok(StreamEvent::ArtifactUpdate(_)) => saw_artifact = true,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    assert_eq!(states, vec![TaskState::Working, TaskState::Completed]);
    assert!(saw_artifact);
}

#[tokio::test]
async fn device_side_failure_fails_the_task() {
    let broker = test_broker(test_config(), None).await;
    let _device = register_camera(
        &broker,
        "cam-1",
        DeviceBehavior::Fail("lens obstructed".to_string()),
    )
    .await;

    let response = broker
        .handler()
        .on_message_send(blocking_send("take a photo"))
        .await
        .unwrap();
    let task = match response {
        SendMessageResponse::Task(task) => task,
        other => panic!("expected task, got {:?}", other),
    };

    assert_eq!(task.status.state, TaskState::Failed);
    assert!(task
        .status
        .message
        .expect("failure note")
        .text_content()
        .contains("lens obstructed"));
}

#[tokio::test]
async fn per_tool_timeout_fails_with_timeout_kind() {
    let broker = test_broker(test_config(), None).await;

    let mut tool = capture_tool();
    tool.timeout_secs = Some(1);
    let device = spawn_device(vec![tool], DeviceBehavior::Never);
    broker
        .registry()
        .register(camera_spec("cam-1"), device.port.clone())
        .await
        .unwrap();

    let response = broker
        .handler()
        .on_message_send(blocking_send("take a photo"))
        .await
        .unwrap();
    let task = match response {
        SendMessageResponse::Task(task) => task,
        other => panic!("expected task, got {:?}", other),
    };

    assert_eq!(task.status.state, TaskState::Failed);
    assert!(task
        .status
        .message
        .expect("failure note")
        .text_content()
        .starts_with("timeout:"));
}

#[tokio::test]
async fn severed_device_channel_fails_with_device_gone() {
    let broker = test_broker(test_config(), None).await;

    let (port, conn) = ChannelDevicePort::attach(vec![capture_tool()]);
    broker
        .registry()
        .register(camera_spec("cam-1"), Arc::new(port))
        .await
        .unwrap();
    // Sever the device side after registration.
    drop(conn);

    let response = broker
        .handler()
        .on_message_send(blocking_send("take a photo"))
        .await
        .unwrap();
    let task = match response {
        SendMessageResponse::Task(task) => task,
        other => panic!("expected task, got {:?}", other),
    };

    assert_eq!(task.status.state, TaskState::Failed);
    assert!(task
        .status
        .message
        .expect("failure note")
        .text_content()
        .starts_with("device-gone:"));
}

#[tokio::test]
async fn kind_filter_matches_only_that_kind() {
    let broker = test_broker(test_config(), None).await;
    let _camera = register_camera(&broker, "cam-1", DeviceBehavior::ReplyFile).await;

    // A second device of a different kind sharing a keyword.
    let tools = vec![ToolDescriptor {
        tool_id: "log_event".to_string(),
        description: None,
        input_schema: serde_json::json!({}),
        output_schema: serde_json::json!({}),
        timeout_secs: None,
        output_modes: None,
    }];
    let recorder = spawn_device(tools, DeviceBehavior::ReplyText("logged".to_string()));
    let mut spec = camera_spec("recorder-1");
    spec.kind = "recorder".to_string();
    broker
        .registry()
        .register(spec, recorder.port.clone())
        .await
        .unwrap();

    let matched = broker
        .registry()
        .match_by_intent(&["photo".to_string()], Some("camera"))
        .await;
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].device_id, "cam-1");
}
