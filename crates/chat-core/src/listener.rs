use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::{
    error::ChatError,
    types::{ChatEvent, ConnectedEvent, DisconnectCause},
};

/// Observer of connection lifecycle and decoded events.
///
/// All callbacks run on the listener delivery task, one at a time and in
/// emission order. Implementations must not block.
pub trait SocketListener: Send + Sync {
    fn on_connecting(&self) {}
    fn on_connected(&self, _event: &ConnectedEvent) {}
    fn on_disconnected(&self, _cause: &DisconnectCause) {}
    fn on_event(&self, _event: &ChatEvent) {}
    fn on_error(&self, _error: &ChatError) {}
}

/// One queued listener notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerCall {
    Connecting,
    Connected(ConnectedEvent),
    Disconnected(DisconnectCause),
    Event(ChatEvent),
    Error(ChatError),
}

impl ListenerCall {
    fn deliver(&self, listener: &dyn SocketListener) {
        match self {
            Self::Connecting => listener.on_connecting(),
            Self::Connected(event) => listener.on_connected(event),
            Self::Disconnected(cause) => listener.on_disconnected(cause),
            Self::Event(event) => listener.on_event(event),
            Self::Error(error) => listener.on_error(error),
        }
    }
}

/// Errors returned by listener delivery.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The delivery task has stopped.
    #[error("listener delivery task is closed")]
    DeliveryClosed,
}

/// Lock-protected listener set. Registration is safe from any thread.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<dyn SocketListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener`; adding the same instance twice is a no-op.
    pub fn add(&self, listener: Arc<dyn SocketListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if !listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove `listener`, returning whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn SocketListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|known| !Arc::ptr_eq(known, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current listener set.
    pub fn snapshot(&self) -> Vec<Arc<dyn SocketListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Sender side of the dedicated listener delivery task.
#[derive(Clone, Debug)]
pub struct ListenerDispatcher {
    call_tx: mpsc::Sender<ListenerCall>,
}

impl ListenerDispatcher {
    /// Spawn the delivery task for `registry`.
    pub fn spawn(registry: Arc<ListenerRegistry>, buffer: usize) -> (Self, JoinHandle<()>) {
        let (call_tx, mut call_rx) = mpsc::channel::<ListenerCall>(buffer.max(1));
        let handle = tokio::spawn(async move {
            while let Some(call) = call_rx.recv().await {
                for listener in registry.snapshot() {
                    call.deliver(listener.as_ref());
                }
            }
            debug!("listener delivery task finished");
        });
        (Self { call_tx }, handle)
    }

    /// Queue one notification for every registered listener.
    pub async fn dispatch(&self, call: ListenerCall) -> Result<(), ListenerError> {
        self.call_tx
            .send(call)
            .await
            .map_err(|_| ListenerError::DeliveryClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("recorder lock").clone()
        }
    }

    impl SocketListener for Recorder {
        fn on_connecting(&self) {
            self.calls.lock().expect("recorder lock").push("connecting".into());
        }

        fn on_event(&self, event: &ChatEvent) {
            self.calls
                .lock()
                .expect("recorder lock")
                .push(event.type_name().into());
        }
    }

    #[test]
    fn registry_ignores_duplicate_registration() {
        let registry = ListenerRegistry::new();
        let listener: Arc<dyn SocketListener> = Arc::new(Recorder::default());
        registry.add(listener.clone());
        registry.add(listener.clone());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&listener));
        assert!(!registry.remove(&listener));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn delivers_calls_in_order() {
        let registry = Arc::new(ListenerRegistry::new());
        let recorder = Arc::new(Recorder::default());
        registry.add(recorder.clone());

        let (dispatcher, handle) = ListenerDispatcher::spawn(registry, 8);
        dispatcher
            .dispatch(ListenerCall::Connecting)
            .await
            .expect("dispatch should work");
        dispatcher
            .dispatch(ListenerCall::Event(ChatEvent::Unknown))
            .await
            .expect("dispatch should work");
        drop(dispatcher);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("delivery should finish")
            .expect("delivery task should not panic");
        assert_eq!(recorder.calls(), vec!["connecting", "unknown"]);
    }
}
