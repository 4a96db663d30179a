use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

/// Application lifecycle signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// App moved to the foreground.
    Started,
    /// App moved to the background.
    Stopped,
    /// App is shutting down for good.
    Terminate,
}

/// Receives lifecycle signals.
pub trait LifecycleHandler: Send + Sync {
    fn on_lifecycle(&self, signal: LifecycleSignal);
}

/// Source of lifecycle signals.
pub trait LifecycleObserver: Send + Sync {
    fn observe(&self, handler: Arc<dyn LifecycleHandler>);
    fn dispose(&self, handler: &Arc<dyn LifecycleHandler>);
}

/// Lifecycle driven by explicit `emit` calls.
#[derive(Default)]
pub struct ManualLifecycle {
    handlers: Mutex<Vec<Arc<dyn LifecycleHandler>>>,
}

impl ManualLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, signal: LifecycleSignal) {
        debug!(?signal, "lifecycle signal");
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler.on_lifecycle(signal);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl LifecycleObserver for ManualLifecycle {
    fn observe(&self, handler: Arc<dyn LifecycleHandler>) {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if !handlers.iter().any(|known| Arc::ptr_eq(known, &handler)) {
            handlers.push(handler);
        }
    }

    fn dispose(&self, handler: &Arc<dyn LifecycleHandler>) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|known| !Arc::ptr_eq(known, handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<LifecycleSignal>>);

    impl LifecycleHandler for Recorder {
        fn on_lifecycle(&self, signal: LifecycleSignal) {
            self.0.lock().expect("recorder lock").push(signal);
        }
    }

    #[test]
    fn forwards_signals_until_disposed() {
        let lifecycle = ManualLifecycle::new();
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn LifecycleHandler> = recorder.clone();
        lifecycle.observe(handler.clone());
        lifecycle.observe(handler.clone());
        assert_eq!(lifecycle.handler_count(), 1);

        lifecycle.emit(LifecycleSignal::Stopped);
        lifecycle.dispose(&handler);
        lifecycle.emit(LifecycleSignal::Started);

        assert_eq!(
            *recorder.0.lock().expect("recorder lock"),
            vec![LifecycleSignal::Stopped]
        );
    }
}
