//! Coordinator/worker protocol
//!
//! Messages exchanged between a coordinator and its workers. Local workers speak
//! this protocol over their stdin/stdout pipes using MessagePack frames;
//! distributed workers exchange the same messages as JSON payloads stored in the
//! coordination store.
//!
//! # Message Flow
//!
//! ```text
//! Coordinator                     Worker
//!     |                              |
//!     |-------- test(round) -------->|
//!     |                              |
//!     |<------- txUpdated -----------|  (every second)
//!     |<------- txUpdated -----------|
//!     |                              |
//!     |<------- testResult ----------|  (or error)
//!     |                              |
//!     |-------- quit --------------->|
//! ```
//!
//! # Message Framing
//!
//! Each frame is prefixed with a 4-byte length field (little-endian u32):
//!
//! ```text
//! [4 bytes: message length][N bytes: MessagePack-serialized message]
//! ```

use crate::stats::TxStats;
use crate::tx::TxStatus;
use crate::Result;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Rate controller selection: a registered type name plus free-form options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateControlSpec {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub opts: serde_json::Value,
}

impl RateControlSpec {
    pub fn new(kind: impl Into<String>, opts: serde_json::Value) -> Self {
        Self { kind: kind.into(), opts }
    }

    /// The default pacing: one transaction per second across all clients
    pub fn default_fixed() -> Self {
        Self::new("fixed-rate", serde_json::json!({ "tps": 1 }))
    }
}

/// How a round is bounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundLength {
    /// Exactly this many transactions
    Count(u64),

    /// Keep submitting for this many seconds
    Duration(u64),
}

/// Round execution parameters for one worker
///
/// Exactly one of `numb` and `tx_duration` is set; use [`RoundMessage::length`]
/// to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundMessage {
    pub label: String,

    pub rate_control: RateControlSpec,

    /// Samples dropped at both ends of the round (transactions for count
    /// rounds, seconds for duration rounds)
    #[serde(default)]
    pub trim: u64,

    /// Workload arguments
    #[serde(default)]
    pub args: serde_json::Value,

    /// Workload (callback) name
    pub cb: String,

    /// Adapter name
    pub config: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numb: Option<u64>,

    /// Round duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_duration: Option<u64>,

    pub total_clients: usize,

    /// Number of clients taking part in this round
    pub clients: usize,

    /// Per-client material from the adapter
    #[serde(default)]
    pub clientargs: Vec<serde_json::Value>,

    /// 0-based client index
    pub client_idx: usize,

    /// 1-based round index
    pub round_idx: usize,

    /// Report raw submission records instead of committed statistics
    #[serde(default)]
    pub confirmation: bool,
}

impl RoundMessage {
    /// A count-bounded round for a single client
    pub fn count(label: impl Into<String>, numb: u64) -> Self {
        Self::base(label, Some(numb), None)
    }

    /// A duration-bounded round (seconds) for a single client
    pub fn duration(label: impl Into<String>, seconds: u64) -> Self {
        Self::base(label, None, Some(seconds))
    }

    fn base(label: impl Into<String>, numb: Option<u64>, tx_duration: Option<u64>) -> Self {
        Self {
            label: label.into(),
            rate_control: RateControlSpec::default_fixed(),
            trim: 0,
            args: serde_json::Value::Null,
            cb: String::new(),
            config: String::new(),
            numb,
            tx_duration,
            total_clients: 1,
            clients: 1,
            clientargs: Vec::new(),
            client_idx: 0,
            round_idx: 1,
            confirmation: false,
        }
    }

    /// The round bound, rejecting messages with both or neither set
    pub fn length(&self) -> Result<RoundLength> {
        match (self.numb, self.tx_duration) {
            (Some(n), None) => Ok(RoundLength::Count(n)),
            (None, Some(d)) => Ok(RoundLength::Duration(d)),
            (Some(_), Some(_)) => anyhow::bail!(
                "round '{}' sets both a transaction count and a duration",
                self.label
            ),
            (None, None) => anyhow::bail!(
                "round '{}' sets neither a transaction count nor a duration",
                self.label
            ),
        }
    }

    /// The client argument this worker uses: its own entry when the list has
    /// one, otherwise the first
    pub fn client_args(&self) -> serde_json::Value {
        self.clientargs
            .get(self.client_idx)
            .or_else(|| self.clientargs.first())
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    /// Number of clients the rate is shared across (never zero)
    pub fn client_count(&self) -> usize {
        self.total_clients.max(1)
    }
}

/// Coordinator → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoordinatorMessage {
    Test(RoundMessage),
    Quit,
}

/// Worker → coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// Periodic progress: transactions submitted since the previous update and
    /// statistics of those committed in the same window
    TxUpdated { submitted: u64, committed: TxStats },

    /// Progress in confirmation mode: the raw records submitted in the window
    TxUpdatedWithConfirmation { submitted: Vec<TxStatus> },

    /// Final statistics of the round
    TestResult(TxStats),

    Error(String),
}

impl WorkerMessage {
    /// Whether this message ends the round for the sending worker
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerMessage::TestResult(_) | WorkerMessage::Error(_))
    }
}

/// Serialize a message into a length-prefixed MessagePack frame
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let msg_bytes = rmp_serde::to_vec_named(msg).context("Failed to serialize message")?;

    let msg_len = u32::try_from(msg_bytes.len()).context("Message too large to frame")?;
    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Deserialize one frame from the front of `buf`, returning the bytes consumed
pub fn deserialize_message<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize)> {
    if buf.len() < 4 {
        anyhow::bail!("Buffer too small for message length (need 4 bytes, got {})", buf.len());
    }

    let msg_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + msg_len {
        anyhow::bail!("Incomplete message (need {} bytes, got {})", 4 + msg_len, buf.len());
    }

    let msg = rmp_serde::from_slice(&buf[4..4 + msg_len]).context("Failed to deserialize message")?;

    Ok((msg, 4 + msg_len))
}

/// Read one raw frame body from a stream
///
/// Returns `Ok(None)` when the stream ends cleanly before a new frame starts.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read message length"),
    }

    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_FRAME_LEN {
        anyhow::bail!("Message too large: {} bytes (max 100MB)", msg_len);
    }

    let mut msg_buf = vec![0u8; msg_len];
    reader
        .read_exact(&mut msg_buf)
        .await
        .context("Failed to read message body")?;
    Ok(Some(msg_buf))
}

/// Decode a frame body read with [`read_frame`]
pub fn decode_frame<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    rmp_serde::from_slice(body).context("Failed to deserialize message")
}

/// Read and decode one frame from a stream
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(body) => decode_frame(&body).map(Some),
        None => Ok(None),
    }
}

/// Write one frame to a stream and flush it
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let framed = serialize_message(msg)?;
    writer.write_all(&framed).await.context("Failed to write message")?;
    writer.flush().await.context("Failed to flush stream")?;
    Ok(())
}

/// Encode a message as the JSON payload stored in a coordination-store node
pub fn to_payload<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(msg).context("Failed to encode message payload")
}

pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).context("Failed to decode message payload")
}
