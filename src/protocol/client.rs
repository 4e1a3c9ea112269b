//! Line protocol client
//!
//! [`RemoteClient`] turns the raw TCP byte stream into correlated
//! request/response pairs. A reader task parses incoming lines and routes
//! each response to the pending request with the matching id; requests are
//! written as single lines and awaited through oneshot channels with a fixed
//! per-request timeout.
//!
//! The client does not know about session state. The owner wires an
//! `on_close` callback that fires exactly once when the transport closes or
//! errors, after every pending request has been rejected.

use crate::error::{RemoteError, Result};
use crate::protocol::wire::{
    self, banner_matches, decode_string, encode_string, format_request, parse_response_line,
    ResponseLine, ResponseStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Callback invoked exactly once when the transport closes or errors.
///
/// The argument is a human-readable reason.
pub type CloseCallback = Box<dyn Fn(&str) + Send + Sync>;

/// A request awaiting its response line
struct PendingRequest {
    command: String,
    tx: oneshot::Sender<Result<String>>,
}

/// State shared between the client handle and its reader task
struct ClientShared {
    /// Requests keyed by id, cleared wholesale on transport close
    pending: Mutex<HashMap<u64, PendingRequest>>,
    /// Set once the transport is unusable; later sends fail fast
    closed: AtomicBool,
    /// Taken (and invoked) by whichever path observes the close first
    on_close: Mutex<Option<CloseCallback>>,
}

impl ClientShared {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route one parsed response line to its pending request.
    fn complete(&self, response: ResponseLine) {
        let entry = self.lock_pending().remove(&response.id);
        let Some(request) = entry else {
            // Late response after a timeout, or noise with a plausible id
            tracing::trace!(id = response.id, "response for unknown request");
            return;
        };

        let result = match response.status {
            ResponseStatus::Ok => Ok(response.data),
            ResponseStatus::Err => {
                let text = decode_string(&response.data);
                if text.is_empty() {
                    Err(RemoteError::Remote("remote command failed".to_string()))
                } else {
                    Err(RemoteError::Remote(text))
                }
            }
        };
        // The caller may have stopped waiting; that is fine
        let _ = request.tx.send(result);
    }

    /// Reject all pending requests and fire `on_close` once.
    fn shutdown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<PendingRequest> = {
            let mut pending = self.lock_pending();
            pending.drain().map(|(_, req)| req).collect()
        };
        for request in drained {
            let _ = request.tx.send(Err(RemoteError::ConnectionClosed(format!(
                "{} while awaiting response to {}",
                reason, request.command
            ))));
        }

        let callback = self
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(reason);
        }
    }
}

/// Client for one TCP connection speaking the remoting line protocol
pub struct RemoteClient {
    shared: Arc<ClientShared>,
    writer: tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    /// Monotonically increasing, never reused within this connection
    next_id: AtomicU64,
    /// Per-request response deadline in milliseconds
    request_timeout_ms: AtomicU64,
}

impl RemoteClient {
    /// Open a TCP connection and start the reader task.
    ///
    /// Fails with [`RemoteError::ConnectTimeout`] when the deadline expires
    /// and with [`RemoteError::Io`] on transport failure.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        on_close: CloseCallback,
    ) -> Result<Arc<Self>> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(RemoteError::ConnectTimeout(timeout.as_millis() as u64)),
        };
        // Request lines are tiny; don't let Nagle batch them
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(ClientShared {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(Some(on_close)),
        });

        let client = Arc::new(Self {
            shared: shared.clone(),
            writer: tokio::sync::Mutex::new(write_half),
            reader_task: Mutex::new(None),
            next_id: AtomicU64::new(0),
            request_timeout_ms: AtomicU64::new(wire::REQUEST_TIMEOUT.as_millis() as u64),
        });

        let reader = tokio::spawn(Self::read_loop(read_half, shared));
        *client
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reader);

        tracing::debug!(host, port, "transport connected");
        Ok(client)
    }

    /// Reader task: extract complete lines and dispatch them by id.
    async fn read_loop(read_half: OwnedReadHalf, shared: Arc<ClientShared>) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_response_line(&line) {
                    Some(response) => shared.complete(response),
                    None => {
                        // Out-of-band or malformed: expected noise
                        tracing::trace!(line = %line, "dropping non-response line");
                    }
                },
                Ok(None) => {
                    shared.shutdown("connection closed by remote");
                    break;
                }
                Err(e) => {
                    shared.shutdown(&format!("read error: {}", e));
                    break;
                }
            }
        }
    }

    /// Whether the transport has closed (locally or remotely).
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Change the per-request response deadline.
    ///
    /// Defaults to [`wire::REQUEST_TIMEOUT`]; applies to requests sent after
    /// the call.
    pub fn set_request_timeout(&self, timeout: Duration) {
        self.request_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    /// Send one command line and await its correlated response.
    ///
    /// Resolves with the response data on `OK`, rejects with
    /// [`RemoteError::Remote`] on `ERR`, [`RemoteError::RequestTimeout`]
    /// once the per-request deadline expires (5 s by default), and
    /// [`RemoteError::NotConnected`] if the transport has already closed.
    pub async fn send_command(&self, command: &str, args: &[String]) -> Result<String> {
        if self.is_closed() {
            return Err(RemoteError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.lock_pending().insert(
            id,
            PendingRequest {
                command: command.to_string(),
                tx,
            },
        );

        let mut line = format_request(id, command, args);
        line.push('\n');
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.shared.lock_pending().remove(&id);
                return Err(e.into());
            }
        }

        let deadline = Duration::from_millis(self.request_timeout_ms.load(Ordering::SeqCst));
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped: table was cleared by a transport close
            Ok(Err(_)) => Err(RemoteError::ConnectionClosed(
                "connection closed".to_string(),
            )),
            Err(_) => {
                self.shared.lock_pending().remove(&id);
                Err(RemoteError::RequestTimeout {
                    id,
                    command: command.to_string(),
                })
            }
        }
    }

    /// Close the transport, rejecting anything still pending.
    ///
    /// Idempotent. Fires the `on_close` callback if it has not fired yet.
    pub async fn close(&self) {
        self.shared.shutdown("closed locally");
        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    // High-level verbs

    /// Handshake: verify the remote speaks this protocol.
    pub async fn hello(&self) -> Result<String> {
        let banner = self.send_command("hello", &[]).await?;
        if banner_matches(&banner) {
            Ok(banner)
        } else {
            Err(RemoteError::ProtocolMismatch(banner))
        }
    }

    /// List global variable names defined by the running cart.
    pub async fn list_globals(&self) -> Result<Vec<String>> {
        let data = self.send_command("listglobals", &[]).await?;
        Ok(data
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Evaluate an expression, returning its textual value.
    pub async fn eval_expr(&self, expr: &str) -> Result<String> {
        self.send_command("evalexpr", &[encode_string(expr)]).await
    }

    /// Execute a statement, returning the textual result or acknowledgement.
    pub async fn eval(&self, statement: &str) -> Result<String> {
        self.send_command("eval", &[encode_string(statement)]).await
    }

    /// Path of the currently loaded cart.
    pub async fn cart_path(&self) -> Result<String> {
        let data = self.send_command("cartpath", &[]).await?;
        Ok(decode_string(&data))
    }

    /// Fetch one cart metadata value (e.g. `title`, `version`).
    pub async fn metadata(&self, key: &str) -> Result<String> {
        let data = self.send_command("metadata", &[encode_string(key)]).await?;
        Ok(decode_string(&data))
    }

    /// Load a cart from the given path, optionally running it immediately.
    pub async fn load_cart(&self, path: &str, run: bool) -> Result<String> {
        let run_flag = if run { "1" } else { "0" };
        self.send_command("load", &[encode_string(path), run_flag.to_string()])
            .await
    }

    /// Ask the remote process to exit.
    pub async fn quit(&self) -> Result<()> {
        self.send_command("quit", &[]).await.map(|_| ())
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        // Reject any stragglers if the handle is dropped without close()
        self.shared.shutdown("client dropped");
        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
