use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use tracing::info;

/// Receives network availability changes.
pub trait NetworkStateListener: Send + Sync {
    fn on_network_connected(&self);
    fn on_network_disconnected(&self);
}

/// Reports whether the device has network connectivity.
pub trait NetworkStateProvider: Send + Sync {
    fn is_connected(&self) -> bool;
    fn subscribe(&self, listener: Arc<dyn NetworkStateListener>);
    fn unsubscribe(&self, listener: &Arc<dyn NetworkStateListener>);
}

/// Network state driven by explicit calls, used by tests and the smoke binary.
pub struct ManualNetworkState {
    connected: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn NetworkStateListener>>>,
}

impl ManualNetworkState {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Update connectivity and notify subscribers when it changed.
    pub fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) == connected {
            return;
        }
        info!(connected, "network state changed");
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if connected {
                listener.on_network_connected();
            } else {
                listener.on_network_disconnected();
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for ManualNetworkState {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkStateProvider for ManualNetworkState {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, listener: Arc<dyn NetworkStateListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if !listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    fn unsubscribe(&self, listener: &Arc<dyn NetworkStateListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|known| !Arc::ptr_eq(known, listener));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Counter {
        up: AtomicUsize,
        down: AtomicUsize,
    }

    impl NetworkStateListener for Counter {
        fn on_network_connected(&self) {
            self.up.fetch_add(1, Ordering::SeqCst);
        }

        fn on_network_disconnected(&self) {
            self.down.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn notifies_only_on_change() {
        let network = ManualNetworkState::new(true);
        let counter = Arc::new(Counter::default());
        let listener: Arc<dyn NetworkStateListener> = counter.clone();
        network.subscribe(listener.clone());

        network.set_connected(true);
        network.set_connected(false);
        network.set_connected(false);
        network.set_connected(true);
        assert_eq!(counter.down.load(Ordering::SeqCst), 1);
        assert_eq!(counter.up.load(Ordering::SeqCst), 1);

        network.unsubscribe(&listener);
        assert_eq!(network.subscriber_count(), 0);
        network.set_connected(false);
        assert_eq!(counter.down.load(Ordering::SeqCst), 1);
    }
}
