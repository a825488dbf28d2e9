//! Out-of-band commit confirmation
//!
//! In confirmation mode, workers do not decide when a transaction is final.
//! They forward their raw submission records, and an independent source (a
//! block listener, typically) reports the transactions it has seen committed.
//! The correlator joins the two streams by transaction id.
//!
//! Either side may arrive first: a confirmation for an id that has not been
//! submitted yet is cached and applied when the submission shows up.
//!
//! Confirmation sources connect over TCP and send one JSON object per line:
//!
//! ```text
//! {"id": "tx-1", "validTime": 1700000000123}
//! ```

use crate::stats::TxStats;
use crate::tx::TxStatus;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Default interval between settlement checks
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// A transaction observed committed by the confirmation source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub id: String,

    /// Commit time, milliseconds since the Unix epoch
    pub valid_time: u64,
}

/// How long the coordinator waits for confirmations after the workers finish
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfirmationSettings {
    pub retry_interval: Duration,

    /// Give up waiting after this long; `None` waits indefinitely
    pub max_wait: Option<Duration>,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_wait: None,
        }
    }
}

/// Joins submissions and confirmations by transaction id
#[derive(Debug, Default)]
pub struct ConfirmationCorrelator {
    /// Submitted, not yet confirmed: id → (worker, record)
    pending: HashMap<String, (usize, TxStatus)>,

    /// Confirmations that arrived before their submission: id → valid time
    early: HashMap<String, u64>,

    /// Final records per worker
    committed: BTreeMap<usize, Vec<TxStatus>>,

    submitted: u64,
}

impl ConfirmationCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the submission records reported by a worker
    ///
    /// Records carrying adapter flags or already marked failed are final
    /// immediately; no confirmation will ever arrive for them.
    pub fn submit(&mut self, worker: usize, records: Vec<TxStatus>) {
        for tx in records {
            self.submitted += 1;
            if tx.flags() != 0 || tx.status() == crate::tx::Status::Failed {
                self.commit(worker, tx);
                continue;
            }
            match self.early.remove(tx.id()) {
                Some(valid_time) => self.commit(worker, confirmed(tx, valid_time)),
                None => {
                    self.pending.insert(tx.id().to_string(), (worker, tx));
                }
            }
        }
    }

    /// Apply a confirmation, caching it if the submission is not known yet
    pub fn confirm(&mut self, confirmation: Confirmation) {
        match self.pending.remove(&confirmation.id) {
            Some((worker, tx)) => self.commit(worker, confirmed(tx, confirmation.valid_time)),
            None => {
                debug!(id = %confirmation.id, "Confirmation ahead of submission");
                self.early.insert(confirmation.id, confirmation.valid_time);
            }
        }
    }

    fn commit(&mut self, worker: usize, tx: TxStatus) {
        self.committed.entry(worker).or_default().push(tx);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn committed(&self) -> u64 {
        self.committed.values().map(|v| v.len() as u64).sum()
    }

    pub fn unconfirmed(&self) -> usize {
        self.pending.len()
    }

    /// Every submission has reached a final state
    pub fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }

    /// Statistics over the final records, per worker
    ///
    /// Transactions still unconfirmed are not included.
    pub fn stats_by_worker(&self) -> BTreeMap<usize, TxStats> {
        self.committed
            .iter()
            .map(|(worker, records)| (*worker, TxStats::from_results(records, true)))
            .collect()
    }
}

fn confirmed(mut tx: TxStatus, valid_time: u64) -> TxStatus {
    tx.set_verified(true);
    tx.set_success_at(valid_time);
    tx
}

/// TCP listener accepting line-delimited JSON confirmations
pub struct ConfirmationListener {
    listener: TcpListener,
}

impl ConfirmationListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind confirmation listener on {}", addr))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read listener address")
    }

    /// Accept sources forever, forwarding every confirmation to `sink`
    pub async fn run(self, sink: UnboundedSender<Confirmation>) -> Result<()> {
        info!(addr = %self.local_addr()?, "Confirmation listener ready");
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .context("Failed to accept confirmation source")?;
            debug!(%peer, "Confirmation source connected");
            tokio::spawn(forward_lines(stream, peer, sink.clone()));
        }
    }
}

async fn forward_lines(stream: TcpStream, peer: SocketAddr, sink: UnboundedSender<Confirmation>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<Confirmation>(&line) {
                Ok(confirmation) => {
                    if sink.send(confirmation).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(%peer, error = %e, "Ignoring malformed confirmation"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "Confirmation source failed");
                break;
            }
        }
    }
    debug!(%peer, "Confirmation source disconnected");
}
