//! Stream fan-out ordering and resubscription: every subscriber observes
//! the same ordered event sequence ending in exactly one final event, and
//! a dropped subscriber can re-attach and catch the remaining events.

mod common;

use std::time::Duration;

use common::{test_broker, test_config};
use fleetlink::server::RequestHandler;
use fleetlink::types::{
    Artifact, Message, Part, StreamEvent, TaskArtifactUpdateEvent, TaskIdParams, TaskState,
};

fn chunk(task_id: &str, context_id: &str, n: usize, last: bool) -> TaskArtifactUpdateEvent {
    TaskArtifactUpdateEvent {
        task_id: task_id.to_string(),
        context_id: context_id.to_string(),
        kind: "artifact-update".to_string(),
        artifact: Artifact {
            artifact_id: "a1".to_string(),
            name: None,
            description: None,
            parts: vec![Part::text(format!("chunk-{}", n))],
            metadata: None,
        },
        // The first chunk creates the artifact; the rest extend it.
        append: Some(n > 1),
        last_chunk: Some(last),
        metadata: None,
    }
}

/// Drain a receiver until the final status update, collecting labels.
async fn collect_labels(
    mut rx: tokio::sync::broadcast::Receiver<StreamEvent>,
) -> (Vec<String>, usize) {
    let mut labels = Vec::new();
    let mut finals = 0;
    loop {
        let event = match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Ok(event)) => event,
            _ => break,
        };
        match event {
            StreamEvent::ArtifactUpdate(update) => {
                for part in &update.artifact.parts {
                    if let Part::Text { text, .. } = part {
                        labels.push(text.clone());
                    }
                }
            }
            StreamEvent::StatusUpdate(update) => {
                if update.r#final {
                    finals += 1;
                    break;
                }
            }
            _ => {}
        }
    }
    (labels, finals)
}

#[tokio::test]
async fn two_subscribers_observe_identical_order_and_one_final() {
    let broker = test_broker(test_config(), None).await;
    let tasks = broker.tasks();

    let task = tasks
        .create_task(Message::user_text("stream me"), None)
        .await
        .unwrap();
    tasks
        .transition(&task.id, TaskState::Working, None)
        .await
        .unwrap();

    let rx1 = tasks.subscribe(&task.id).await.unwrap();
    let rx2 = tasks.subscribe(&task.id).await.unwrap();

    for n in 1..=5 {
        tasks
            .append_artifact_chunk(chunk(&task.id, &task.context_id, n, false))
            .await
            .unwrap();
    }
    tasks
        .append_artifact_chunk(chunk(&task.id, &task.context_id, 6, true))
        .await
        .unwrap();
    tasks
        .transition(&task.id, TaskState::Completed, None)
        .await
        .unwrap();

    let (labels1, finals1) = collect_labels(rx1).await;
    let (labels2, finals2) = collect_labels(rx2).await;

    let expected: Vec<String> = (1..=6).map(|n| format!("chunk-{}", n)).collect();
    assert_eq!(labels1, expected);
    assert_eq!(labels2, expected);
    assert_eq!(finals1, 1);
    assert_eq!(finals2, 1);
}

#[tokio::test]
async fn chunks_concatenate_into_the_final_artifact() {
    let broker = test_broker(test_config(), None).await;
    let tasks = broker.tasks();

    let task = tasks
        .create_task(Message::user_text("stream me"), None)
        .await
        .unwrap();
    tasks
        .transition(&task.id, TaskState::Working, None)
        .await
        .unwrap();

    for n in 1..=5 {
        tasks
            .append_artifact_chunk(chunk(&task.id, &task.context_id, n, false))
            .await
            .unwrap();
    }
    let sealed = tasks
        .append_artifact_chunk(chunk(&task.id, &task.context_id, 6, true))
        .await
        .unwrap();

    let artifacts = sealed.artifacts.expect("artifacts");
    assert_eq!(artifacts.len(), 1);
    let concatenated: Vec<String> = artifacts[0]
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        concatenated,
        (1..=6).map(|n| format!("chunk-{}", n)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn resubscribe_after_disconnect_catches_remaining_events() {
    let broker = test_broker(test_config(), None).await;
    let handler = broker.handler();
    let tasks = broker.tasks();

    let task = tasks
        .create_task(Message::user_text("stream me"), None)
        .await
        .unwrap();
    tasks
        .transition(&task.id, TaskState::Working, None)
        .await
        .unwrap();

    // First subscriber sees chunks 1-3 and then disconnects.
    let mut early = tasks.subscribe(&task.id).await.unwrap();
    for n in 1..=3 {
        tasks
            .append_artifact_chunk(chunk(&task.id, &task.context_id, n, false))
            .await
            .unwrap();
    }
    for _ in 0..3 {
        let event = early.recv().await.unwrap();
        assert!(matches!(event, StreamEvent::ArtifactUpdate(_)));
    }
    drop(early);

    // Dropping the stream must not disturb the task.
    assert_eq!(
        tasks.get(&task.id, None).await.unwrap().status.state,
        TaskState::Working
    );

    // Re-attach through the handler's resubscribe surface.
    let resumed = handler
        .on_resubscribe(TaskIdParams {
            id: task.id.clone(),
            metadata: None,
        })
        .await
        .unwrap();

    for n in 4..=5 {
        tasks
            .append_artifact_chunk(chunk(&task.id, &task.context_id, n, false))
            .await
            .unwrap();
    }
    tasks
        .append_artifact_chunk(chunk(&task.id, &task.context_id, 6, true))
        .await
        .unwrap();
    tasks
        .transition(&task.id, TaskState::Completed, None)
        .await
        .unwrap();

    let (labels, finals) = collect_labels(resumed).await;
    assert_eq!(
        labels,
        vec!["chunk-4", "chunk-5", "chunk-6"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
    assert_eq!(finals, 1);
}

#[tokio::test]
async fn resubscribe_to_terminal_task_fails() {
    let broker = test_broker(test_config(), None).await;
    let tasks = broker.tasks();

    let task = tasks
        .create_task(Message::user_text("done already"), None)
        .await
        .unwrap();
    tasks
        .transition(&task.id, TaskState::Working, None)
        .await
        .unwrap();
    tasks
        .transition(&task.id, TaskState::Completed, None)
        .await
        .unwrap();

    assert!(broker
        .handler()
        .on_resubscribe(TaskIdParams {
            id: task.id.clone(),
            metadata: None,
        })
        .await
        .is_err());
}
