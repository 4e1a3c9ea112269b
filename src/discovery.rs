//! Liveness probing for externally-discovered remote targets
//!
//! Candidate `(host, port)` records come from outside this crate (a
//! discovery directory on disk, typically one record per launched process).
//! [`probe_candidates`] checks which targets actually host a live,
//! protocol-compatible remote and reports the rest as stale. The caller owns
//! the record store and deletes stale entries itself.

use crate::protocol::RemoteClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One externally-sourced candidate target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub host: String,
    pub port: u16,
    /// When the process that wrote the record reported starting
    pub started_at: DateTime<Utc>,
}

impl DiscoveryRecord {
    /// The `host:port` target this record points at.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A probed target that answered the handshake with the expected banner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTarget {
    pub host: String,
    pub port: u16,
    /// Loaded cart path, when the remote could report one
    pub cart_path: Option<String>,
    pub title: Option<String>,
    pub version: Option<String>,
}

/// Outcome of probing a candidate set.
///
/// `stale` holds every record whose probe failed plus the superseded
/// duplicates of each live target; deleting them is the caller's job.
#[derive(Debug, Default)]
pub struct ProbeReport {
    pub live: Vec<LiveTarget>,
    pub stale: Vec<DiscoveryRecord>,
}

/// Group records by target, newest first within each group.
fn group_by_target(records: Vec<DiscoveryRecord>) -> HashMap<String, Vec<DiscoveryRecord>> {
    let mut groups: HashMap<String, Vec<DiscoveryRecord>> = HashMap::new();
    for record in records {
        groups.entry(record.target()).or_default().push(record);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    }
    groups
}

/// Probe every candidate target and sort the records into live and stale.
///
/// Records for the same `host:port` are tried newest-first; the first
/// protocol-correct connection claims the target and supersedes the rest of
/// its group. Cart path and metadata are fetched best-effort after a
/// successful handshake; their failures do not invalidate the target.
pub async fn probe_candidates(
    records: Vec<DiscoveryRecord>,
    connect_timeout: Duration,
) -> ProbeReport {
    let mut report = ProbeReport::default();

    for (target, group) in group_by_target(records) {
        let mut remaining = group.into_iter();
        let mut claimed = false;
        for record in remaining.by_ref() {
            match probe_one(&record, connect_timeout).await {
                Some(live) => {
                    tracing::info!(%target, "live remote found");
                    report.live.push(live);
                    claimed = true;
                    break;
                }
                None => report.stale.push(record),
            }
        }
        if claimed {
            // Older records for a claimed target are superseded
            report.stale.extend(remaining);
        }
    }
    report
}

/// Probe one record with a short-lived client, always closed afterward.
async fn probe_one(record: &DiscoveryRecord, connect_timeout: Duration) -> Option<LiveTarget> {
    // The probe owns the whole client lifetime; nothing to notify on close
    let on_close = Box::new(|_: &str| {});
    let client = match RemoteClient::connect(&record.host, record.port, connect_timeout, on_close)
        .await
    {
        Ok(client) => client,
        Err(e) => {
            tracing::debug!(target = %record.target(), error = %e, "probe connect failed");
            return None;
        }
    };

    let live = match client.hello().await {
        Ok(_) => Some(LiveTarget {
            host: record.host.clone(),
            port: record.port,
            cart_path: client.cart_path().await.ok().filter(|p| !p.is_empty()),
            title: client.metadata("title").await.ok().filter(|t| !t.is_empty()),
            version: client
                .metadata("version")
                .await
                .ok()
                .filter(|v| !v.is_empty()),
        }),
        Err(e) => {
            tracing::debug!(target = %record.target(), error = %e, "probe handshake failed");
            None
        }
    };

    client.close().await;
    live
}
