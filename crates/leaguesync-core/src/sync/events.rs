//! Sync events for the UI.
//!
//! Events go out on a broadcast channel, so nothing a listener does can reenter
//! or stall the sync loop. `EventBus::add_listener` wraps a callback in its own
//! task; a panicking callback is logged and the listener keeps running.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::models::{OperationKind, Table};

/// Buffered events per subscriber before the slowest one starts missing events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStart {
        pending: usize,
    },
    SyncComplete {
        processed: usize,
        failed: usize,
    },
    SyncError {
        message: String,
    },
    OperationComplete {
        id: String,
        table: Table,
        operation: OperationKind,
    },
    OperationFailed {
        id: String,
        table: Table,
        operation: OperationKind,
        error: String,
        retry_count: u32,
        will_retry: bool,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::SyncStart { .. } => "sync_start",
            SyncEvent::SyncComplete { .. } => "sync_complete",
            SyncEvent::SyncError { .. } => "sync_error",
            SyncEvent::OperationComplete { .. } => "operation_complete",
            SyncEvent::OperationFailed { .. } => "operation_failed",
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Best effort: with no subscribers the event is dropped.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Call `listener` for every event until the returned handle is dropped or
    /// unsubscribed. Must be called from within a tokio runtime.
    pub fn add_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                            warn!(event = event.kind(), "Sync listener panicked");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Sync listener fell behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        ListenerHandle { task }
    }
}

/// Keeps a listener attached. Dropping it detaches the listener.
#[must_use = "dropping the handle immediately unsubscribes the listener"]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::OperationComplete {
            id: "op1".to_string(),
            table: Table::Profiles,
            operation: OperationKind::Update,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "operation_complete");
        assert_eq!(json["table"], "profiles");
        assert_eq!(event.kind(), "operation_complete");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(SyncEvent::SyncStart { pending: 0 });
    }

    #[tokio::test]
    async fn test_subscribe_receives_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SyncEvent::SyncStart { pending: 2 });
        bus.emit(SyncEvent::SyncComplete { processed: 2, failed: 0 });

        assert_eq!(rx.recv().await.unwrap().kind(), "sync_start");
        assert_eq!(rx.recv().await.unwrap().kind(), "sync_complete");
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<&'static str>>>, count: usize) {
        for _ in 0..100 {
            if seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_panicking_listener_keeps_listening() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_listener = seen.clone();
        let _handle = bus.add_listener(move |event| {
            seen_in_listener.lock().unwrap().push(event.kind());
            if matches!(event, SyncEvent::SyncStart { .. }) {
                panic!("listener bug");
            }
        });
        tokio::task::yield_now().await;

        bus.emit(SyncEvent::SyncStart { pending: 1 });
        bus.emit(SyncEvent::SyncComplete { processed: 1, failed: 0 });
        wait_for(&seen, 2).await;

        assert_eq!(*seen.lock().unwrap(), vec!["sync_start", "sync_complete"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_listener = seen.clone();
        let handle = bus.add_listener(move |event| {
            seen_in_listener.lock().unwrap().push(event.kind());
        });

        bus.emit(SyncEvent::SyncStart { pending: 0 });
        wait_for(&seen, 1).await;
        handle.unsubscribe();
        tokio::task::yield_now().await;

        bus.emit(SyncEvent::SyncComplete { processed: 0, failed: 0 });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["sync_start"]);
    }
}
