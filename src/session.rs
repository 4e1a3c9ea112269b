//! Session state machine
//!
//! [`RemoteSession`] owns zero-or-one [`RemoteClient`] and tracks the
//! connection lifecycle: `NotConnected -> Connecting -> Connected`, with
//! `Error` reachable from `Connecting` or `Connected` on transport failure
//! and `NotConnected` reachable from anywhere via an explicit disconnect.
//!
//! State changes are published as [`SessionSnapshot`]s through a watch
//! channel; the subscription engines and any UI observe the session through
//! those snapshots and the fail-fast evaluate operations. At most one
//! transport connection is open at a time; connecting to a new target
//! implicitly disconnects the previous one. No automatic reconnection
//! happens here.

use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::protocol::{CloseCallback, RemoteClient};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Identifiers provided by the host runtime rather than the running cart.
///
/// `listglobals` reports everything in the global table; these are filtered
/// out so callers only see cart-defined globals.
const HOST_BUILTINS: &[&str] = &[
    // callbacks
    "TIC", "BOOT", "BDR", "MENU", "OVR", "SCN",
    // api
    "btn", "btnp", "circ", "circb", "clip", "cls", "elli", "ellib", "exit", "fget", "font",
    "fset", "key", "keyp", "line", "map", "memcpy", "memset", "mget", "mouse", "mset", "music",
    "peek", "peek1", "peek2", "peek4", "pix", "pmem", "poke", "poke1", "poke2", "poke4", "print",
    "rect", "rectb", "reset", "sfx", "spr", "sync", "time", "trace", "tri", "trib", "tstamp",
    "ttri", "vbank",
];

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No transport, no attempt in progress
    NotConnected,
    /// A connect attempt (dial + hello) is in flight
    Connecting,
    /// Transport is open and the handshake succeeded
    Connected,
    /// The transport failed; `last_error` describes why
    Error,
}

/// Point-in-time view of the session, published on every state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Current lifecycle state
    pub state: SessionState,
    /// Last target host, if any connect was attempted
    pub host: Option<String>,
    /// Last target port, if any connect was attempted
    pub port: Option<u16>,
    /// Most recent failure, present in the `Error` state
    pub last_error: Option<String>,
    /// When the current connection was established
    pub connected_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    fn initial() -> Self {
        Self {
            state: SessionState::NotConnected,
            host: None,
            port: None,
            last_error: None,
            connected_at: None,
        }
    }
}

struct SessionInner {
    state: SessionState,
    host: Option<String>,
    port: Option<u16>,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    client: Option<Arc<RemoteClient>>,
    /// Re-entrancy guard: suppresses the Error transition that the client's
    /// close callback would otherwise trigger during an explicit disconnect
    disconnecting: bool,
    /// Incremented per connect attempt so a stale client's close callback
    /// cannot touch a newer connection's state
    generation: u64,
}

/// The session state machine; exclusive owner of the transport client
pub struct RemoteSession {
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionSnapshot>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl RemoteSession {
    /// Create a session in the `NotConnected` state.
    pub fn new(config: &RemoteConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionSnapshot::initial());
        Arc::new(Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::NotConnected,
                host: None,
                port: None,
                last_error: None,
                connected_at: None,
                client: None,
                disconnecting: false,
                generation: 0,
            }),
            state_tx,
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a snapshot of the current state. Call with the lock held.
    fn emit(&self, inner: &SessionInner) {
        self.state_tx.send_replace(SessionSnapshot {
            state: inner.state,
            host: inner.host.clone(),
            port: inner.port,
            last_error: inner.last_error.clone(),
            connected_at: inner.connected_at,
        });
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_tx.borrow().clone()
    }

    /// Watch receiver for state-change snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_tx.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Whether evaluate operations would be accepted right now.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Connect to a remote process and verify the protocol handshake.
    ///
    /// No-op while already `Connecting`, or when already `Connected` to the
    /// same host/port. Connecting to a different target disconnects the
    /// current one first.
    pub async fn connect(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        {
            let inner = self.lock();
            match inner.state {
                SessionState::Connecting => return Ok(()),
                SessionState::Connected
                    if inner.host.as_deref() == Some(host) && inner.port == Some(port) =>
                {
                    return Ok(());
                }
                _ => {}
            }
        }

        self.disconnect(Some("connecting to a new target")).await;

        let generation = {
            let mut inner = self.lock();
            inner.generation += 1;
            inner.state = SessionState::Connecting;
            inner.host = Some(host.to_string());
            inner.port = Some(port);
            inner.last_error = None;
            inner.connected_at = None;
            self.emit(&inner);
            inner.generation
        };

        tracing::info!(host, port, "connecting to remote process");

        let weak = Arc::downgrade(self);
        let on_close: CloseCallback = Box::new(move |reason| {
            if let Some(session) = weak.upgrade() {
                session.on_transport_closed(generation, reason);
            }
        });

        let client =
            match RemoteClient::connect(host, port, self.connect_timeout, on_close).await {
                Ok(client) => client,
                Err(e) => {
                    self.record_connect_failure(generation, &e);
                    tracing::warn!(host, port, error = %e, "connect failed");
                    return Err(e);
                }
            };
        client.set_request_timeout(self.request_timeout);

        // Liveness and protocol check before exposing the client
        if let Err(e) = client.hello().await {
            // Invalidate the close callback so closing the partial client
            // cannot clobber the recorded error
            self.record_connect_failure(generation, &e);
            client.close().await;
            tracing::warn!(host, port, error = %e, "handshake failed");
            return Err(e);
        }

        let stale = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != SessionState::Connecting {
                true
            } else {
                inner.client = Some(client.clone());
                inner.state = SessionState::Connected;
                inner.connected_at = Some(Utc::now());
                self.emit(&inner);
                false
            }
        };
        if stale {
            // A disconnect raced the handshake; drop the fresh client
            client.close().await;
            return Err(RemoteError::ConnectionClosed(
                "disconnected during connect".to_string(),
            ));
        }
        tracing::info!(host, port, "session connected");
        Ok(())
    }

    /// Record a failed connect attempt, unless a newer attempt superseded it.
    fn record_connect_failure(&self, generation: u64, error: &RemoteError) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        // Invalidate this attempt's close callback
        inner.generation += 1;
        inner.client = None;
        inner.last_error = Some(error.to_string());
        inner.state = SessionState::Error;
        self.emit(&inner);
    }

    /// Transport close/error callback, ignored for stale generations and
    /// during an explicit disconnect.
    fn on_transport_closed(&self, generation: u64, reason: &str) {
        let mut inner = self.lock();
        if inner.disconnecting || inner.generation != generation {
            return;
        }
        tracing::warn!(reason, "transport lost");
        inner.client = None;
        inner.connected_at = None;
        inner.last_error = Some(reason.to_string());
        inner.state = SessionState::Error;
        self.emit(&inner);
    }

    /// Tear down the connection, if any. Idempotent.
    pub async fn disconnect(&self, reason: Option<&str>) {
        let client = {
            let mut inner = self.lock();
            if inner.state == SessionState::NotConnected && inner.client.is_none() {
                return;
            }
            inner.disconnecting = true;
            let client = inner.client.take();
            inner.state = SessionState::NotConnected;
            inner.last_error = None;
            inner.connected_at = None;
            self.emit(&inner);
            client
        };

        tracing::info!(reason = reason.unwrap_or("disconnect requested"), "session disconnected");
        if let Some(client) = client {
            client.close().await;
        }

        self.lock().disconnecting = false;
    }

    /// Clone the client handle, failing fast unless `Connected`.
    fn client_if_connected(&self) -> Result<Arc<RemoteClient>> {
        let inner = self.lock();
        match (inner.state, &inner.client) {
            (SessionState::Connected, Some(client)) => Ok(client.clone()),
            _ => Err(RemoteError::NotConnected),
        }
    }

    /// Evaluate an expression on the remote process.
    pub async fn eval_expr(&self, expr: &str) -> Result<String> {
        self.client_if_connected()?.eval_expr(expr).await
    }

    /// Execute a statement on the remote process.
    pub async fn eval(&self, statement: &str) -> Result<String> {
        self.client_if_connected()?.eval(statement).await
    }

    /// List cart-defined globals, with host builtins filtered out.
    pub async fn list_globals(&self) -> Result<Vec<String>> {
        let names = self.client_if_connected()?.list_globals().await?;
        Ok(filter_host_builtins(names))
    }

    /// Path of the currently loaded cart.
    pub async fn cart_path(&self) -> Result<String> {
        self.client_if_connected()?.cart_path().await
    }

    /// Fetch one cart metadata value.
    pub async fn metadata(&self, key: &str) -> Result<String> {
        self.client_if_connected()?.metadata(key).await
    }

    /// Load a cart on the remote process.
    pub async fn load_cart(&self, path: &str, run: bool) -> Result<String> {
        self.client_if_connected()?.load_cart(path, run).await
    }

    /// Ask the remote process to exit, then drop the session state.
    ///
    /// A remote that exits immediately tears the transport down before (or
    /// instead of) acknowledging; that still counts as a successful quit.
    pub async fn quit(&self) -> Result<()> {
        let client = self.client_if_connected()?;
        let result = match client.quit().await {
            Err(e) if e.is_transport_failure() => Ok(()),
            other => other,
        };
        self.disconnect(Some("quit requested")).await;
        result
    }
}

/// Remove host-builtin identifiers from a globals listing.
fn filter_host_builtins(mut names: Vec<String>) -> Vec<String> {
    names.retain(|name| !HOST_BUILTINS.contains(&name.as_str()));
    names
}
