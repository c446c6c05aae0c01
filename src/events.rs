use crate::log::LogLine;
use crate::state::ServerState;
use crate::supervisor::SupervisorError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::warn;

/// Receives supervisor notifications. Called synchronously on whichever task
/// raised the event; implementations that need a particular thread must
/// hand the event off themselves.
pub trait SupervisorListener: Send + Sync {
    fn on_state_changed(&self, _state: ServerState) {}
    fn on_log_line(&self, _line: &LogLine) {}
    fn on_error(&self, _error: &SupervisorError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out to subscribed listeners, in subscription order. A panicking
/// listener is logged and skipped; the rest still receive the event.
#[derive(Default)]
pub struct EventPublisher {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn SupervisorListener>)>>,
    next_id: AtomicU64,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn SupervisorListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn publish_state(&self, state: ServerState) {
        self.dispatch("state change", |l| l.on_state_changed(state));
    }

    pub fn publish_line(&self, line: &LogLine) {
        self.dispatch("log line", |l| l.on_log_line(line));
    }

    pub fn publish_error(&self, error: &SupervisorError) {
        self.dispatch("error", |l| l.on_error(error));
    }

    fn dispatch(&self, event: &str, f: impl Fn(&dyn SupervisorListener)) {
        // Snapshot so a listener may (un)subscribe from inside a callback.
        let listeners: Vec<Arc<dyn SupervisorListener>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!("listener panicked while handling {event}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Channel adapter
// ---------------------------------------------------------------------------

/// Owned copy of a notification, for consumers that prefer a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    StateChanged(ServerState),
    Log(LogLine),
    Error { message: String, configuration: bool },
}

/// Forwards every notification into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SupervisorListener for ChannelListener {
    fn on_state_changed(&self, state: ServerState) {
        let _ = self.tx.send(ServerEvent::StateChanged(state));
    }

    fn on_log_line(&self, line: &LogLine) {
        let _ = self.tx.send(ServerEvent::Log(line.clone()));
    }

    fn on_error(&self, error: &SupervisorError) {
        let _ = self.tx.send(ServerEvent::Error {
            message: error.to_string(),
            configuration: error.is_configuration(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LaunchError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        tag: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl SupervisorListener for Recorder {
        fn on_state_changed(&self, state: ServerState) {
            self.seen.lock().unwrap().push(format!("{}:{state}", self.tag));
        }

        fn on_log_line(&self, line: &LogLine) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.tag, line.text));
        }
    }

    struct Panicker;

    impl SupervisorListener for Panicker {
        fn on_state_changed(&self, _state: ServerState) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let publisher = EventPublisher::new();
        publisher.subscribe(Arc::new(Recorder {
            tag: "a",
            seen: seen.clone(),
        }));
        publisher.subscribe(Arc::new(Recorder {
            tag: "b",
            seen: seen.clone(),
        }));

        publisher.publish_state(ServerState::Starting);
        publisher.publish_line(&LogLine::manager("hello"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a:starting", "b:starting", "a:hello", "b:hello"]
        );
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let publisher = EventPublisher::new();
        publisher.subscribe(Arc::new(Panicker));
        publisher.subscribe(Arc::new(Recorder {
            tag: "after",
            seen: seen.clone(),
        }));

        publisher.publish_state(ServerState::Running);
        assert_eq!(*seen.lock().unwrap(), vec!["after:running"]);
    }

    #[test]
    fn test_unsubscribe() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let publisher = EventPublisher::new();
        let id = publisher.subscribe(Arc::new(Recorder {
            tag: "x",
            seen: seen.clone(),
        }));
        assert_eq!(publisher.listener_count(), 1);

        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));
        publisher.publish_state(ServerState::Running);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_default_methods_are_noops() {
        struct Silent;
        impl SupervisorListener for Silent {}

        let publisher = EventPublisher::new();
        publisher.subscribe(Arc::new(Silent));
        publisher.publish_state(ServerState::Running);
        publisher.publish_line(&LogLine::manager("ignored"));
    }

    #[test]
    fn test_channel_listener_forwards_everything() {
        let (listener, mut rx) = ChannelListener::new();
        let publisher = EventPublisher::new();
        publisher.subscribe(Arc::new(listener));

        publisher.publish_state(ServerState::Starting);
        publisher.publish_line(&LogLine::manager("narration"));
        publisher.publish_error(&SupervisorError::Launch(LaunchError::PathNotConfigured));

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::StateChanged(ServerState::Starting)
        );
        match rx.try_recv().unwrap() {
            ServerEvent::Log(line) => assert_eq!(line.text, "narration"),
            other => panic!("expected log event, got {other:?}"),
        }
        match rx.try_recv().unwrap() {
            ServerEvent::Error { configuration, .. } => assert!(configuration),
            other => panic!("expected error event, got {other:?}"),
        }
    }
}
