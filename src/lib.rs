//! # tic-remote: live observation of a running TIC-80 process
//!
//! A client library for TIC-80's textual remoting protocol. It attaches to a
//! running fantasy-console process over TCP, evaluates expressions and
//! statements in the cart's environment, and drives two subscription
//! engines: a watch monitor (latest value-or-error per expression) and a
//! scope manager (fixed-rate numeric time series with windowed resampling
//! for plotting).
//!
//! ## Architecture
//!
//! - **Protocol**: newline-delimited request/response framing with numeric
//!   id correlation ([`protocol`])
//! - **Session**: connection lifecycle state machine, at most one transport
//!   at a time ([`session`])
//! - **Watches / Scope**: reference-counted subscription engines polling
//!   through the session ([`watch`], [`scope`])
//! - **Discovery**: liveness probing of externally-sourced candidate
//!   targets ([`discovery`])
//! - **Communication**: refresh notifications cross to presentation code
//!   over a crossbeam channel; session state over a tokio watch channel
//!
//! ## Example
//!
//! ```ignore
//! use tic_remote::{RemoteConfig, RemoteHub};
//!
//! #[tokio::main]
//! async fn main() -> tic_remote::Result<()> {
//!     let (hub, refresh_rx) = RemoteHub::new(&RemoteConfig::default());
//!     hub.connect("127.0.0.1", 7654).await?;
//!
//!     hub.subscribe_expression("player.hp");
//!     hub.subscribe_plot_series("player.x", Some(30.0), None);
//!
//!     while let Ok(event) = refresh_rx.recv() {
//!         println!("{:?}: {:?}", event, hub.watch_results());
//!     }
//!     hub.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod scope;
pub mod session;
pub mod types;
pub mod watch;

pub use config::RemoteConfig;
pub use discovery::{DiscoveryRecord, LiveTarget, ProbeReport};
pub use error::{RemoteError, Result};
pub use hub::RemoteHub;
pub use scope::{ScopeManager, ScopeSeriesSnapshot};
pub use session::{RemoteSession, SessionSnapshot, SessionState};
pub use types::{EvalOutcome, RefreshEvent, Sample};
pub use watch::WatchMonitor;
