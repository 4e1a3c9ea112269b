//! Expression subscription monitor
//!
//! Maintains a reference-counted set of subscribed expressions and, on a
//! fixed scan tick, evaluates all of them concurrently against the session,
//! caching the latest value-or-error per expression. The scan interval is
//! decoupled from the effective evaluation rate: a tick only issues
//! evaluations when the configured poll interval has elapsed, the session is
//! connected, and at least one subscription exists.
//!
//! Consumers drain [`RefreshEvent::Watches`] from the shared refresh channel
//! and call [`WatchMonitor::results_snapshot`] at their own cadence.

use crate::config::RemoteConfig;
use crate::session::RemoteSession;
use crate::types::{EvalOutcome, RefreshEvent};
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

/// Fixed scan tick; effective polls are rate-limited separately
pub const WATCH_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Floor for the effective poll interval, however high the configured rate
pub const MIN_POLL_INTERVAL_MS: u64 = 16;

struct WatchState {
    /// Subscription reference counts by expression
    subscriptions: HashMap<String, usize>,
    /// Latest outcome per subscribed expression
    results: HashMap<String, EvalOutcome>,
    /// When the last effective poll was issued
    last_poll: Option<Instant>,
}

/// Periodically evaluates subscribed expressions and caches the outcomes
pub struct WatchMonitor {
    session: Arc<RemoteSession>,
    state: Mutex<WatchState>,
    refresh_tx: Sender<RefreshEvent>,
    /// Effective poll interval in milliseconds, derived from the poll rate
    poll_interval_ms: AtomicU64,
    running: AtomicBool,
}

impl WatchMonitor {
    /// Create a monitor polling through the given session.
    pub fn new(
        session: Arc<RemoteSession>,
        refresh_tx: Sender<RefreshEvent>,
        config: &RemoteConfig,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            session,
            state: Mutex::new(WatchState {
                subscriptions: HashMap::new(),
                results: HashMap::new(),
                last_poll: None,
            }),
            refresh_tx,
            poll_interval_ms: AtomicU64::new(0),
            running: AtomicBool::new(true),
        });
        monitor.set_poll_rate(config.watch_poll_rate_hz);
        monitor
    }

    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the effective evaluation rate. Sub-tick rates are floored at
    /// [`MIN_POLL_INTERVAL_MS`] so a misconfigured rate cannot hammer the
    /// transport.
    pub fn set_poll_rate(&self, rate_hz: u32) {
        let interval = (1000 / u64::from(rate_hz.max(1))).max(MIN_POLL_INTERVAL_MS);
        self.poll_interval_ms.store(interval, Ordering::SeqCst);
    }

    /// Reference-count a subscription for `expr`.
    pub fn subscribe(&self, expr: &str) {
        let mut state = self.lock();
        *state.subscriptions.entry(expr.to_string()).or_insert(0) += 1;
    }

    /// Drop one reference to `expr`; the last reference removes the
    /// subscription and its cached result.
    pub fn unsubscribe(&self, expr: &str) {
        let mut state = self.lock();
        let Some(count) = state.subscriptions.get_mut(expr) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            state.subscriptions.remove(expr);
            state.results.remove(expr);
        }
    }

    /// Latest value-or-error per subscribed expression.
    pub fn results_snapshot(&self) -> HashMap<String, EvalOutcome> {
        self.lock().results.clone()
    }

    /// Number of distinct subscribed expressions.
    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Spawn the scan loop. Stop it with [`WatchMonitor::shutdown`].
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCH_SCAN_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while monitor.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                monitor.tick().await;
            }
            tracing::debug!("watch monitor stopped");
        })
    }

    /// Stop the scan loop after its current tick.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One scan tick. Usually a no-op; issues an effective poll only when
    /// connected, subscribed, and the poll interval has elapsed.
    async fn tick(&self) {
        if !self.session.is_connected() {
            // Don't keep showing stale values after losing the connection
            let cleared = {
                let mut state = self.lock();
                if state.subscriptions.is_empty() && state.results.is_empty() {
                    false
                } else {
                    state.subscriptions.clear();
                    state.results.clear();
                    state.last_poll = None;
                    true
                }
            };
            if cleared {
                self.signal_refresh();
            }
            return;
        }

        let expressions: Vec<String> = {
            let mut state = self.lock();
            if state.subscriptions.is_empty() {
                return;
            }
            let now = Instant::now();
            let interval = Duration::from_millis(self.poll_interval_ms.load(Ordering::SeqCst));
            if let Some(last) = state.last_poll {
                if now.duration_since(last) < interval {
                    return;
                }
            }
            state.last_poll = Some(now);
            state.subscriptions.keys().cloned().collect()
        };

        // Fan out; each expression's outcome is independent of the others
        let mut evals = JoinSet::new();
        for expr in expressions {
            let session = self.session.clone();
            evals.spawn(async move {
                let outcome = match session.eval_expr(&expr).await {
                    Ok(value) => EvalOutcome::Value(value),
                    Err(e) => EvalOutcome::Error(e.to_string()),
                };
                (expr, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = evals.join_next().await {
            match joined {
                Ok(pair) => outcomes.push(pair),
                Err(e) => tracing::debug!(error = %e, "watch evaluation task failed"),
            }
        }

        {
            let mut state = self.lock();
            for (expr, outcome) in outcomes {
                // The expression may have been unsubscribed mid-poll
                if state.subscriptions.contains_key(&expr) {
                    state.results.insert(expr, outcome);
                }
            }
        }
        self.signal_refresh();
    }

    /// Exactly one refresh per effective poll or clear.
    fn signal_refresh(&self) {
        let _ = self.refresh_tx.send(RefreshEvent::Watches);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn test_monitor() -> (Arc<WatchMonitor>, crossbeam_channel::Receiver<RefreshEvent>) {
        let config = RemoteConfig::default();
        let session = RemoteSession::new(&config);
        let (tx, rx) = unbounded();
        (WatchMonitor::new(session, tx, &config), rx)
    }

    #[test]
    fn test_refcount_survives_partial_unsubscribe() {
        let (monitor, _rx) = test_monitor();

        for _ in 0..3 {
            monitor.subscribe("player_x");
        }
        monitor.unsubscribe("player_x");
        monitor.unsubscribe("player_x");
        assert_eq!(monitor.subscription_count(), 1);

        // Cached result for a live subscription
        monitor
            .lock()
            .results
            .insert("player_x".to_string(), EvalOutcome::Value("3".to_string()));

        // The last unsubscribe removes both the count and the cached result
        monitor.unsubscribe("player_x");
        assert_eq!(monitor.subscription_count(), 0);
        assert!(monitor.results_snapshot().is_empty());
    }

    #[test]
    fn test_unsubscribe_unknown_expression_is_noop() {
        let (monitor, _rx) = test_monitor();
        monitor.unsubscribe("never_subscribed");
        assert_eq!(monitor.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_clears_subscriptions_and_cache() {
        let (monitor, rx) = test_monitor();

        monitor.subscribe("hp");
        monitor
            .lock()
            .results
            .insert("hp".to_string(), EvalOutcome::Value("10".to_string()));

        // Session is NotConnected, so the tick must clear everything and
        // signal exactly one refresh
        monitor.tick().await;
        assert_eq!(monitor.subscription_count(), 0);
        assert!(monitor.results_snapshot().is_empty());
        assert_eq!(rx.try_recv(), Ok(RefreshEvent::Watches));
        assert!(rx.try_recv().is_err());

        // Idle ticks with nothing to clear stay silent
        monitor.tick().await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_poll_rate_floor() {
        let (monitor, _rx) = test_monitor();
        monitor.set_poll_rate(1000);
        assert_eq!(
            monitor.poll_interval_ms.load(Ordering::SeqCst),
            MIN_POLL_INTERVAL_MS
        );
        monitor.set_poll_rate(0);
        assert_eq!(monitor.poll_interval_ms.load(Ordering::SeqCst), 1000);
        monitor.set_poll_rate(10);
        assert_eq!(monitor.poll_interval_ms.load(Ordering::SeqCst), 100);
    }
}
