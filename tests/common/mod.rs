//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

use crossbeam_channel::Receiver;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tic_remote::protocol::{decode_string, encode_string, HELLO_BANNER};
use tic_remote::RefreshEvent;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How a [`MockRemote`] answers one request
pub enum MockReply {
    /// `<id> OK <data>`
    Ok(String),
    /// `<id> ERR <data>`
    Err(String),
    /// Never answer; the request is left hanging
    Silent,
    /// Write these lines verbatim, no id substitution
    Raw(Vec<String>),
    /// `<id> OK <data>` after a delay, letting later replies overtake it
    DelayedOk(String, Duration),
    /// Drop the connection without answering
    Close,
}

/// Decides the reply for a `(command, raw args)` request
pub type MockHandler = Arc<dyn Fn(&str, &str) -> MockReply + Send + Sync>;

/// In-process TCP server speaking the remoting line protocol.
///
/// Accepts any number of connections and answers each request through the
/// configured handler. Aborted on drop.
pub struct MockRemote {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

/// Install a log subscriber once so `RUST_LOG` works in test runs.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl MockRemote {
    pub async fn spawn(handler: MockHandler) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock listener");
        let addr = listener.local_addr().expect("mock listener addr");
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_connection(socket, handler.clone()));
            }
        });
        Self { addr, accept_task }
    }

    /// A remote with a running cart: correct banner, incrementing numeric
    /// evaluation results, a few globals, and cart metadata.
    pub async fn spawn_cart() -> Self {
        Self::spawn(cart_handler()).await
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for MockRemote {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(socket: TcpStream, handler: MockHandler) {
    let (read_half, write_half) = socket.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.trim().splitn(3, char::is_whitespace);
        let (Some(id), Some(command)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(id) = id.parse::<u64>() else {
            continue;
        };
        let args = parts.next().unwrap_or("");

        match handler(command, args) {
            MockReply::Ok(data) => write_line(&writer, &format!("{} OK {}", id, data)).await,
            MockReply::Err(data) => write_line(&writer, &format!("{} ERR {}", id, data)).await,
            MockReply::Silent => {}
            MockReply::Raw(raw) => {
                for raw_line in raw {
                    write_line(&writer, &raw_line).await;
                }
            }
            MockReply::DelayedOk(data, delay) => {
                let writer = writer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    write_line(&writer, &format!("{} OK {}", id, data)).await;
                });
            }
            MockReply::Close => break,
        }
    }
}

async fn write_line(writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>, line: &str) {
    let mut writer = writer.lock().await;
    let _ = writer.write_all(line.as_bytes()).await;
    let _ = writer.write_all(b"\n").await;
}

/// Handler for a healthy remote with a loaded cart.
///
/// `evalexpr` returns an incrementing counter so tests can observe fresh
/// samples arriving over time.
pub fn cart_handler() -> MockHandler {
    let counter = Arc::new(AtomicU64::new(0));
    Arc::new(move |command, args| match command {
        "hello" => MockReply::Ok(HELLO_BANNER.to_string()),
        "evalexpr" => {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            MockReply::Ok(n.to_string())
        }
        "eval" => MockReply::Ok(String::new()),
        "listglobals" => MockReply::Ok("TIC,player_x,cls,score".to_string()),
        "cartpath" => MockReply::Ok(encode_string("/tmp/game.tic")),
        "metadata" => match decode_string(args).as_str() {
            "title" => MockReply::Ok(encode_string("My Game")),
            "version" => MockReply::Ok(encode_string("1.2")),
            _ => MockReply::Err(encode_string("unknown key")),
        },
        // Echo the raw arguments so tests can assert the wire form
        "load" => MockReply::Ok(args.to_string()),
        "quit" => MockReply::Ok(String::new()),
        _ => MockReply::Err(encode_string("unknown command")),
    })
}

/// Drain the refresh channel until the wanted event shows up.
pub async fn wait_for_event(rx: &Receiver<RefreshEvent>, want: RefreshEvent) {
    for _ in 0..200 {
        while let Ok(event) = rx.try_recv() {
            if event == want {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {:?}", want);
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for condition");
}
