//! Event queue — broadcast fan-out for per-task streaming events.
//!
//! One queue exists per live task. The task manager publishes
//! [`StreamEvent`]s under the task's exclusive section, which gives every
//! subscriber the same total order; subscribers are broadcast receivers,
//! so attaching and detaching never blocks the publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::StreamEvent;

/// Default channel capacity for the event queue.
const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast queue for one task's ordered event stream.
///
/// Slow subscribers observe `RecvError::Lagged`; they must re-fetch the
/// task snapshot and resubscribe rather than assume a contiguous stream.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: broadcast::Sender<StreamEvent>,
    closed: Arc<AtomicBool>,
}

impl EventQueue {
    /// Create a queue with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than 0");
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a queue with the default capacity (1024).
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers.
    ///
    /// Events published to a closed queue are silently dropped. A send
    /// error (no subscribers) is not fatal — the persisted task state is
    /// the source of truth, streams are a live view.
    pub fn publish(&self, event: StreamEvent) {
        if self.closed.load(Ordering::Acquire) {
            warn!("Queue is closed. Event will not be published.");
            return;
        }

        match self.tx.send(event) {
            Ok(count) => {
                debug!(subscriber_count = count, "Published event to queue");
            }
            Err(_) => {
                debug!("No live subscribers for event");
            }
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Close the queue; subsequent publishes are dropped.
    pub fn close(&self) {
        debug!("Closing event queue");
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskState, TaskStatus, TaskStatusUpdateEvent};

    fn status_event(state: TaskState, r#final: bool) -> StreamEvent {
        StreamEvent::StatusUpdate(TaskStatusUpdateEvent {
            task_id: "t1".to_string(),
            context_id: "c1".to_string(),
            kind: "status-update".to_string(),
            status: TaskStatus {
                state,
                message: None,
                timestamp: None,
            },
            r#final,
            metadata: None,
        })
    }

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let queue = EventQueue::with_default_capacity();
        let mut rx1 = queue.subscribe();
        let mut rx2 = queue.subscribe();

        queue.publish(status_event(TaskState::Working, false));
        queue.publish(status_event(TaskState::Completed, true));

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                StreamEvent::StatusUpdate(u) => assert_eq!(u.status.state, TaskState::Working),
                other => panic!("unexpected event: {:?}", other),
            }
            match rx.recv().await.unwrap() {
                StreamEvent::StatusUpdate(u) => {
                    assert_eq!(u.status.state, TaskState::Completed);
                    assert!(u.r#final);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events() {
        let queue = EventQueue::with_default_capacity();
        let _keepalive = queue.subscribe();
        queue.publish(status_event(TaskState::Working, false));

        let mut late = queue.subscribe();
        queue.publish(status_event(TaskState::Completed, true));

        match late.recv().await.unwrap() {
            StreamEvent::StatusUpdate(u) => assert_eq!(u.status.state, TaskState::Completed),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_queue_drops_events() {
        let queue = EventQueue::with_default_capacity();
        let mut rx = queue.subscribe();
        queue.close();
        assert!(queue.is_closed());
        queue.publish(status_event(TaskState::Working, false));

        // The channel stays open but nothing arrives.
        let got = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(got.is_err());
    }

    #[test]
    fn subscriber_count_tracks_receivers() {
        let queue = EventQueue::with_default_capacity();
        assert_eq!(queue.subscriber_count(), 0);
        let rx = queue.subscribe();
        assert_eq!(queue.subscriber_count(), 1);
        drop(rx);
        assert_eq!(queue.subscriber_count(), 0);
    }
}
