//! Typed event bus connecting the supervisor, host router, certificate
//! orchestrator and the control-plane surface.
//!
//! Every mutation and lifecycle transition is published here so the
//! subsystems stay decoupled: the router rebuilds its map on app
//! mutations, the certificate orchestrator pre-issues the combined
//! local certificate when a local-like host appears, and the admin
//! collaborator streams the whole feed.

use crate::health::HealthState;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

const BUS_CAPACITY: usize = 256;

/// Which child stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Discriminant for [`Event`], used to filter subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AppAdded,
    AppUpdated,
    AppRemoved,
    AppStart,
    AppStop,
    AppExit,
    AppLog,
    AppHealth,
    ConfigSaved,
}

/// An event published on the gateway bus
#[derive(Debug, Clone)]
pub enum Event {
    AppAdded { host: String },
    AppUpdated { host: String },
    AppRemoved { host: String },
    AppStart { host: String, pid: Option<u32> },
    AppStop { host: String },
    AppExit { host: String, code: Option<i32> },
    AppLog { host: String, stream: LogStream, line: String },
    AppHealth { host: String, state: HealthState },
    ConfigSaved,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::AppAdded { .. } => EventKind::AppAdded,
            Event::AppUpdated { .. } => EventKind::AppUpdated,
            Event::AppRemoved { .. } => EventKind::AppRemoved,
            Event::AppStart { .. } => EventKind::AppStart,
            Event::AppStop { .. } => EventKind::AppStop,
            Event::AppExit { .. } => EventKind::AppExit,
            Event::AppLog { .. } => EventKind::AppLog,
            Event::AppHealth { .. } => EventKind::AppHealth,
            Event::ConfigSaved => EventKind::ConfigSaved,
        }
    }

    /// The host an event concerns, if any
    pub fn host(&self) -> Option<&str> {
        match self {
            Event::AppAdded { host }
            | Event::AppUpdated { host }
            | Event::AppRemoved { host }
            | Event::AppStart { host, .. }
            | Event::AppStop { host }
            | Event::AppExit { host, .. }
            | Event::AppLog { host, .. }
            | Event::AppHealth { host, .. } => Some(host),
            Event::ConfigSaved => None,
        }
    }
}

/// Process-wide publish/subscribe channel for [`Event`]s.
///
/// Cloning is cheap; all clones share the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is listening.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Raw subscription receiving every event
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Subscribe a handler to a set of event kinds. The handler runs on a
    /// dedicated task; dropping the returned guard cancels it.
    pub fn subscribe_kinds<F>(&self, kinds: &[EventKind], handler: F) -> SubscriptionGuard
    where
        F: Fn(Event) + Send + 'static,
    {
        let kinds: Vec<EventKind> = kinds.to_vec();
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if kinds.contains(&event.kind()) {
                            handler(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        SubscriptionGuard { handle }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels its subscription task when dropped
pub struct SubscriptionGuard {
    handle: JoinHandle<()>,
}

impl SubscriptionGuard {
    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn subscribe_kinds_filters_events() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        let _guard = bus.subscribe_kinds(&[EventKind::AppAdded], move |event| {
            assert!(matches!(event, Event::AppAdded { .. }));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Give the subscriber task a chance to start listening
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.emit(Event::AppAdded {
            host: "a.example.com".to_string(),
        });
        bus.emit(Event::ConfigSaved);
        bus.emit(Event::AppRemoved {
            host: "a.example.com".to_string(),
        });
        bus.emit(Event::AppAdded {
            host: "b.example.com".to_string(),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropping_guard_cancels_subscription() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        let guard = bus.subscribe_kinds(&[EventKind::ConfigSaved], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.emit(Event::ConfigSaved);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.emit(Event::ConfigSaved);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_kind_and_host() {
        let event = Event::AppExit {
            host: "app.test".to_string(),
            code: Some(1),
        };
        assert_eq!(event.kind(), EventKind::AppExit);
        assert_eq!(event.host(), Some("app.test"));
        assert_eq!(Event::ConfigSaved.host(), None);
    }
}
