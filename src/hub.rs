//! Consumer facade
//!
//! [`RemoteHub`] wires the session, the watch monitor, and the scope manager
//! together behind one handle and owns their background loops. External
//! presentation code holds the hub plus the crossbeam receiver returned by
//! [`RemoteHub::new`], drains [`RefreshEvent`]s at its own cadence, and pulls
//! snapshots when refreshed.

use crate::config::RemoteConfig;
use crate::discovery::{self, DiscoveryRecord, ProbeReport};
use crate::error::Result;
use crate::scope::{ScopeManager, ScopeSeriesSnapshot};
use crate::session::{RemoteSession, SessionSnapshot};
use crate::types::{EvalOutcome, RefreshEvent};
use crate::watch::WatchMonitor;
use crossbeam_channel::{unbounded, Receiver};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One remote process connection with its subscription engines
pub struct RemoteHub {
    session: Arc<RemoteSession>,
    watches: Arc<WatchMonitor>,
    scope: Arc<ScopeManager>,
    connect_timeout: Duration,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteHub {
    /// Build the session and both subscription engines and spawn their tick
    /// loops. The returned receiver carries refresh notifications until
    /// [`RemoteHub::shutdown`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &RemoteConfig) -> (Arc<Self>, Receiver<RefreshEvent>) {
        let (refresh_tx, refresh_rx) = unbounded();
        let session = RemoteSession::new(config);
        let watches = WatchMonitor::new(session.clone(), refresh_tx.clone(), config);
        let scope = ScopeManager::new(session.clone(), refresh_tx, config);

        let loops = vec![watches.spawn(), scope.spawn()];
        let hub = Arc::new(Self {
            session,
            watches,
            scope,
            connect_timeout: config.connect_timeout(),
            loops: Mutex::new(loops),
        });
        (hub, refresh_rx)
    }

    /// Stop the tick loops and tear down the connection.
    pub async fn shutdown(&self) {
        self.watches.shutdown();
        self.scope.shutdown();
        let loops = std::mem::take(
            &mut *self.loops.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in loops {
            task.abort();
        }
        self.session.disconnect(Some("shutting down")).await;
    }

    // Session

    /// Connect to a remote process, verifying the protocol handshake.
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.session.connect(host, port).await
    }

    /// Disconnect from the remote process, if connected.
    pub async fn disconnect(&self) {
        self.session.disconnect(None).await;
    }

    /// Current session snapshot.
    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Watch receiver for session state changes.
    pub fn subscribe_session(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.subscribe()
    }

    /// Whether evaluate operations would be accepted right now.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Evaluate an expression on the remote process.
    pub async fn eval_expr(&self, expr: &str) -> Result<String> {
        self.session.eval_expr(expr).await
    }

    /// Execute a statement on the remote process.
    pub async fn eval(&self, statement: &str) -> Result<String> {
        self.session.eval(statement).await
    }

    /// List cart-defined globals.
    pub async fn list_globals(&self) -> Result<Vec<String>> {
        self.session.list_globals().await
    }

    /// Path of the currently loaded cart.
    pub async fn cart_path(&self) -> Result<String> {
        self.session.cart_path().await
    }

    /// Fetch one cart metadata value.
    pub async fn metadata(&self, key: &str) -> Result<String> {
        self.session.metadata(key).await
    }

    /// Load a cart on the remote process.
    pub async fn load_cart(&self, path: &str, run: bool) -> Result<String> {
        self.session.load_cart(path, run).await
    }

    /// Ask the remote process to exit.
    pub async fn quit(&self) -> Result<()> {
        self.session.quit().await
    }

    // Watches

    /// Subscribe an expression for periodic evaluation.
    pub fn subscribe_expression(&self, expr: &str) {
        self.watches.subscribe(expr);
    }

    /// Drop one watch reference for an expression.
    pub fn unsubscribe_expression(&self, expr: &str) {
        self.watches.unsubscribe(expr);
    }

    /// Latest value-or-error per watched expression.
    pub fn watch_results(&self) -> HashMap<String, EvalOutcome> {
        self.watches.results_snapshot()
    }

    /// Change the watch evaluation rate.
    pub fn set_watch_poll_rate(&self, rate_hz: u32) {
        self.watches.set_poll_rate(rate_hz);
    }

    // Scope

    /// Subscribe a plot series at the given rate (default when `None`).
    pub fn subscribe_plot_series(
        &self,
        expr: &str,
        rate_hz: Option<f64>,
        sample_count: Option<usize>,
    ) {
        self.scope.subscribe(expr, rate_hz, sample_count);
    }

    /// Drop one plot reference for a series.
    pub fn unsubscribe_plot_series(&self, expr: &str, rate_hz: Option<f64>) {
        self.scope.unsubscribe(expr, rate_hz);
    }

    /// Freeze or unfreeze a series' display window.
    pub fn set_plot_paused(&self, expr: &str, rate_hz: Option<f64>, paused: bool) {
        self.scope.set_paused(expr, rate_hz, paused);
    }

    /// Resampled view of every active plot series.
    pub fn plot_snapshot(&self) -> HashMap<String, ScopeSeriesSnapshot> {
        self.scope.snapshot()
    }

    // Discovery

    /// Probe candidate records and report live targets and stale records.
    pub async fn probe_candidates(&self, records: Vec<DiscoveryRecord>) -> ProbeReport {
        discovery::probe_candidates(records, self.connect_timeout).await
    }
}
