use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chat_core::ReconnectBackoff;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::HealthConfig;

/// Actions the health monitor asks its owner to perform.
pub trait HealthCallbacks: Send + Sync + 'static {
    /// Send a liveness check on the open socket.
    fn check(&self);
    /// Reconnect; called only while reconnection is still needed.
    fn reconnect(&self);
}

struct MonitorState {
    last_event: Instant,
    consecutive_failures: u32,
    disconnected: bool,
    monitor: Option<CancellationToken>,
    reconnect: Option<CancellationToken>,
}

struct Inner {
    config: HealthConfig,
    callbacks: Arc<dyn HealthCallbacks>,
    state: Mutex<MonitorState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn need_to_reconnect(&self) -> bool {
        let state = self.state();
        state.disconnected || state.last_event.elapsed() >= self.config.no_event_threshold
    }
}

/// Periodic liveness check with randomized reconnect backoff.
///
/// Timers run as tokio tasks and are cancelled, not just ignored, by `stop`.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, callbacks: Arc<dyn HealthCallbacks>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                callbacks,
                state: Mutex::new(MonitorState {
                    last_event: Instant::now(),
                    consecutive_failures: 0,
                    disconnected: false,
                    monitor: None,
                    reconnect: None,
                }),
            }),
        }
    }

    /// Reset liveness tracking and start monitoring.
    pub fn start(&self) {
        debug!("starting health monitor");
        {
            let mut state = self.inner.state();
            state.last_event = Instant::now();
            state.disconnected = false;
            state.consecutive_failures = 0;
        }
        self.reset();
    }

    /// Cancel all pending timers.
    pub fn stop(&self) {
        let mut state = self.inner.state();
        cancel(&mut state.monitor);
        cancel(&mut state.reconnect);
    }

    /// Record socket activity: cancel a pending reconnect and reset failures.
    pub fn ack(&self) {
        let mut state = self.inner.state();
        state.last_event = Instant::now();
        state.disconnected = false;
        state.consecutive_failures = 0;
        cancel(&mut state.reconnect);
    }

    /// Mark the socket as gone and restart monitoring.
    pub fn on_disconnected(&self) {
        self.inner.state().disconnected = true;
        self.reset();
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.state().consecutive_failures
    }

    fn reset(&self) {
        let token = CancellationToken::new();
        {
            let mut state = self.inner.state();
            cancel(&mut state.monitor);
            cancel(&mut state.reconnect);
            state.monitor = Some(token.clone());
        }
        let inner = self.inner.clone();
        tokio::spawn(run_monitor(inner, token));
    }
}

fn cancel(slot: &mut Option<CancellationToken>) {
    if let Some(token) = slot.take() {
        token.cancel();
    }
}

async fn sleep_or_cancel(token: &CancellationToken, duration: std::time::Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

async fn run_monitor(inner: Arc<Inner>, token: CancellationToken) {
    if !sleep_or_cancel(&token, inner.config.monitor_interval).await {
        return;
    }
    loop {
        if inner.need_to_reconnect() {
            schedule_reconnect(&inner);
            return;
        }
        if !sleep_or_cancel(&token, inner.config.monitor_interval).await {
            return;
        }
        inner.callbacks.check();
        if !sleep_or_cancel(&token, inner.config.health_check_interval).await {
            return;
        }
    }
}

fn schedule_reconnect(inner: &Arc<Inner>) {
    let token = CancellationToken::new();
    let delay = {
        let mut state = inner.state();
        cancel(&mut state.reconnect);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.reconnect = Some(token.clone());
        ReconnectBackoff::delay(state.consecutive_failures)
    };
    info!(delay_ms = delay.as_millis() as u64, "next connection attempt scheduled");

    let inner = inner.clone();
    tokio::spawn(async move {
        if sleep_or_cancel(&token, delay).await && inner.need_to_reconnect() {
            inner.callbacks.reconnect();
        }
    });
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[derive(Default)]
    struct Counters {
        checks: AtomicUsize,
        reconnects: AtomicUsize,
    }

    impl HealthCallbacks for Counters {
        fn check(&self) {
            self.checks.fetch_add(1, Ordering::SeqCst);
        }

        fn reconnect(&self) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor() -> (HealthMonitor, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let monitor = HealthMonitor::new(HealthConfig::default(), counters.clone());
        (monitor, counters)
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_schedules_reconnect_inside_first_backoff_window() {
        let (monitor, counters) = monitor();
        monitor.on_disconnected();

        sleep(Duration::from_millis(1_200)).await;
        assert_eq!(counters.reconnects.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.consecutive_failures(), 1);

        sleep(Duration::from_millis(2_400)).await;
        assert_eq!(counters.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_cancels_pending_reconnect_and_resets_failures() {
        let (monitor, counters) = monitor();
        monitor.on_disconnected();
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(monitor.consecutive_failures(), 1);

        monitor.ack();
        assert_eq!(monitor.consecutive_failures(), 0);
        sleep(Duration::from_secs(20)).await;
        assert_eq!(counters.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_clears_escalated_backoff() {
        let (monitor, counters) = monitor();
        monitor.on_disconnected();
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(monitor.consecutive_failures(), 1);

        monitor.start();
        assert_eq!(monitor.consecutive_failures(), 0);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(counters.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_socket_is_checked_periodically() {
        let (monitor, counters) = monitor();
        monitor.start();

        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(counters.checks.load(Ordering::SeqCst), 1);

        monitor.ack();
        sleep(Duration::from_secs(11)).await;
        assert_eq!(counters.checks.load(Ordering::SeqCst), 2);
        assert_eq!(counters.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_threshold_triggers_reconnect() {
        let (monitor, counters) = monitor();
        monitor.start();

        sleep(Duration::from_secs(40)).await;
        assert!(counters.checks.load(Ordering::SeqCst) >= 2);
        assert_eq!(counters.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_every_timer() {
        let (monitor, counters) = monitor();
        monitor.on_disconnected();
        sleep(Duration::from_millis(1_100)).await;
        monitor.stop();

        sleep(Duration::from_secs(60)).await;
        assert_eq!(counters.reconnects.load(Ordering::SeqCst), 0);
        assert_eq!(counters.checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_disconnects_escalate_backoff() {
        let (monitor, counters) = monitor();
        for expected in 1..=3 {
            monitor.on_disconnected();
            sleep(Duration::from_secs(30)).await;
            assert_eq!(monitor.consecutive_failures(), expected);
        }
        assert_eq!(counters.reconnects.load(Ordering::SeqCst), 3);
    }
}
