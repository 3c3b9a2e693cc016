//! Events published by the engine
//!
//! The core only publishes. Observers subscribe to an [`EventBus`] and drain their
//! own channel on whatever task or thread suits them.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::models::TaskId;

/// Events that can be emitted by the download engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DownloadEvent {
    TaskAdded {
        task_id: TaskId,
        file_name: String,
        is_segmented: bool,
    },
    TaskStarted {
        task_id: TaskId,
    },
    /// Byte progress of a plain-file download
    TaskProgress {
        task_id: TaskId,
        bytes_done: u64,
        bytes_total: u64,
        /// Bytes per second
        speed: f64,
        eta_seconds: Option<u64>,
    },
    /// Segment progress of an HLS download, speed smoothed over recent samples
    SegmentProgress {
        task_id: TaskId,
        segments_done: u32,
        segments_total: u32,
        speed: f64,
    },
    TaskPaused {
        task_id: TaskId,
    },
    TaskResumed {
        task_id: TaskId,
    },
    TaskCompleted {
        task_id: TaskId,
        file_path: String,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskDeleted {
        task_id: TaskId,
    },
    /// A failed run was scheduled to restart
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        delay_ms: u64,
    },
}

impl DownloadEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::TaskAdded { task_id, .. }
            | Self::TaskStarted { task_id }
            | Self::TaskProgress { task_id, .. }
            | Self::SegmentProgress { task_id, .. }
            | Self::TaskPaused { task_id }
            | Self::TaskResumed { task_id }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskDeleted { task_id }
            | Self::TaskRetrying { task_id, .. } => *task_id,
        }
    }

    /// Completion and failure end a task's run and are never throttled
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TaskCompleted { .. } | Self::TaskFailed { .. })
    }
}

/// Channel for communication between the engine and observers
pub type EventSender = mpsc::UnboundedSender<DownloadEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<DownloadEvent>;

/// Anything the engine can publish events into
pub trait EventSink: Send + Sync {
    fn publish(&self, event: DownloadEvent);
}

impl EventSink for EventSender {
    fn publish(&self, event: DownloadEvent) {
        let _ = self.send(event);
    }
}

/// Fan-out to any number of subscribers; closed subscribers are dropped on the next publish
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<EventSender>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: DownloadEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = DownloadEvent::TaskFailed {
            task_id: 7,
            error: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "TaskFailed");
        assert_eq!(json["payload"]["task_id"], 7);
        assert_eq!(json["payload"]["error"], "boom");

        let parsed: DownloadEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_terminal_events() {
        assert!(DownloadEvent::TaskCompleted {
            task_id: 1,
            file_path: "/tmp/a".into()
        }
        .is_terminal());
        assert!(!DownloadEvent::TaskPaused { task_id: 1 }.is_terminal());
        assert_eq!(DownloadEvent::TaskDeleted { task_id: 5 }.task_id(), 5);
    }

    #[tokio::test]
    async fn test_bus_fans_out_and_prunes() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(second);
        bus.publish(DownloadEvent::TaskStarted { task_id: 3 });

        assert_eq!(
            first.recv().await,
            Some(DownloadEvent::TaskStarted { task_id: 3 })
        );
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_sender_is_a_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: &dyn EventSink = &tx;
        sink.publish(DownloadEvent::TaskResumed { task_id: 9 });
        assert_eq!(rx.recv().await.unwrap().task_id(), 9);
    }
}
