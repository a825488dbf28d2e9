//! Rate control
//!
//! A rate controller decides when a simulated client may submit its next
//! transaction. The worker runner awaits [`RateController::apply_rate_control`]
//! after every submission; it is the only suspension point of the submission
//! loop and therefore its sole backpressure mechanism.
//!
//! # Architecture
//!
//! Controllers are selected by the `type` string of a [`RateControlSpec`]. The
//! [`RateControllerRegistry`] maps type names to constructors, so additional
//! controllers can be registered next to the built-in ones:
//!
//! - **fixed-rate**: constant TPS split across clients
//! - **zero-rate**: submit once, then idle for the rest of a duration round
//! - **pid-rate**: keep the backlog at a target with a PID law
//! - **composite-rate**: run weighted sub-controllers one after another
//! - **record-rate** / **replay-rate**: capture and reproduce submission times
//! - **fixed-feedback-rate**: fixed pacing plus backlog throttling
//! - **linear-rate**: interpolate between a starting and a finishing TPS
//! - **fixed-backlog**: sleep in proportion to the backlog error
//!
//! # Lifecycle
//!
//! 1. Construct via [`RateControllerRegistry::create`] (validates options)
//! 2. [`RateController::init`] with the round message (fails fast on an
//!    incompatible round)
//! 3. [`RateController::apply_rate_control`] once per submitted transaction
//! 4. [`RateController::end`] when the round is over
//!
//! # Example
//!
//! ```
//! use txpulse::protocol::{RateControlSpec, RoundMessage};
//! use txpulse::rate::RateControllerRegistry;
//!
//! let registry = RateControllerRegistry::default();
//! let spec = RateControlSpec::new("fixed-rate", serde_json::json!({"tps": 50}));
//! let mut controller = registry.create(&spec).unwrap();
//! controller.init(&RoundMessage::count("warmup", 100)).unwrap();
//! ```

pub mod composite;
pub mod fixed;
pub mod fixed_backlog;
pub mod fixed_feedback;
pub mod linear;
pub mod no_rate;
pub mod pid;
pub mod record;
pub mod replay;

use crate::protocol::{RateControlSpec, RoundMessage};
use crate::stats::TxStats;
use crate::tx::TxStatus;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::time::Instant;

/// Errors raised while building or initializing a rate controller
#[derive(Debug, Error)]
pub enum RateControlError {
    #[error("unknown rate controller type '{0}'")]
    UnknownType(String),

    #[error("{controller} cannot be used for round '{label}': {reason}")]
    IncompatibleRound {
        controller: &'static str,
        label: String,
        reason: String,
    },

    #[error("invalid weights: {0}")]
    InvalidWeights(String),

    #[error("invalid option '{option}' for {controller}: {reason}")]
    InvalidOption {
        controller: &'static str,
        option: String,
        reason: String,
    },

    #[error("trace file {}: {reason}", path.display())]
    TraceFile { path: PathBuf, reason: String },
}

/// Pacing engine consulted before every submission
///
/// # Arguments of `apply_rate_control`
///
/// * `start` - when the (possibly remapped) round started
/// * `idx` - 0-based index of the transaction just submitted
/// * `recent_results` - results received so far in the round, in arrival order
/// * `result_stats` - `[cumulative, latest window]` statistics; may be empty
///   before the first report window closes
#[async_trait]
pub trait RateController: Send {
    /// Configure from the round message, rejecting incompatible rounds
    fn init(&mut self, msg: &RoundMessage) -> Result<(), RateControlError>;

    /// Delay the caller as long as the pacing strategy demands
    async fn apply_rate_control(
        &mut self,
        start: Instant,
        idx: u64,
        recent_results: &[TxStatus],
        result_stats: &[TxStats],
    );

    /// Flush and clean up at the end of the round
    async fn end(&mut self) -> crate::Result<()>;
}

/// Constructor for a registered controller type
///
/// Receives the registry so that wrapping controllers can build their children.
pub type ControllerFactory =
    fn(&serde_json::Value, &RateControllerRegistry) -> Result<Box<dyn RateController>, RateControlError>;

/// Rate controller constructors keyed by type name
#[derive(Clone)]
pub struct RateControllerRegistry {
    factories: HashMap<String, ControllerFactory>,
}

impl RateControllerRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    /// A registry with every built-in controller
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(fixed::TYPE, fixed::create);
        registry.register(no_rate::TYPE, no_rate::create);
        registry.register(pid::TYPE, pid::create);
        registry.register(composite::TYPE, composite::create);
        registry.register(record::TYPE, record::create);
        registry.register(replay::TYPE, replay::create);
        registry.register(fixed_feedback::TYPE, fixed_feedback::create);
        registry.register(linear::TYPE, linear::create);
        registry.register(fixed_backlog::TYPE, fixed_backlog::create);
        registry
    }

    /// Register (or replace) a controller type
    pub fn register(&mut self, kind: impl Into<String>, factory: ControllerFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Build a controller from its spec
    pub fn create(&self, spec: &RateControlSpec) -> Result<Box<dyn RateController>, RateControlError> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| RateControlError::UnknownType(spec.kind.clone()))?;
        factory(&spec.opts, self)
    }
}

impl Default for RateControllerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for RateControllerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateControllerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Typed access to a controller's free-form options
///
/// Numbers may be given as JSON numbers or numeric strings.
#[derive(Debug, Clone, Copy)]
pub struct Options<'a> {
    controller: &'static str,
    value: &'a serde_json::Value,
}

impl<'a> Options<'a> {
    pub fn new(controller: &'static str, value: &'a serde_json::Value) -> Self {
        Self { controller, value }
    }

    fn get(&self, name: &str) -> Option<&'a serde_json::Value> {
        self.value.get(name).filter(|v| !v.is_null())
    }

    fn invalid(&self, name: &str, reason: impl Into<String>) -> RateControlError {
        RateControlError::InvalidOption {
            controller: self.controller,
            option: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Optional number
    pub fn f64(&self, name: &str) -> Result<Option<f64>, RateControlError> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => as_number(v)
                .map(Some)
                .ok_or_else(|| self.invalid(name, format!("expected a number, got {}", v))),
        }
    }

    /// Required number
    pub fn require_f64(&self, name: &str) -> Result<f64, RateControlError> {
        self.f64(name)?.ok_or_else(|| self.invalid(name, "missing"))
    }

    /// Number with a default; zero counts as unset, as do missing values
    pub fn f64_or(&self, name: &str, default: f64) -> Result<f64, RateControlError> {
        Ok(self.f64(name)?.filter(|v| *v != 0.0).unwrap_or(default))
    }

    pub fn bool(&self, name: &str) -> bool {
        match self.get(name) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn str(&self, name: &str) -> Option<&'a str> {
        self.get(name).and_then(|v| v.as_str())
    }

    pub fn require_str(&self, name: &str) -> Result<&'a str, RateControlError> {
        self.str(name).ok_or_else(|| self.invalid(name, "missing"))
    }

    /// A nested value that must be present
    pub fn require_value(&self, name: &str) -> Result<&'a serde_json::Value, RateControlError> {
        self.get(name).ok_or_else(|| self.invalid(name, "missing"))
    }
}

/// Read a JSON number or numeric string
pub(crate) fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Per-client inter-submission interval (ms) for a total TPS; 0 disables pacing
pub(crate) fn sleep_time_per_client(tps: f64, msg: &RoundMessage) -> f64 {
    let tps_per_client = tps / msg.client_count() as f64;
    if tps_per_client > 0.0 {
        1000.0 / tps_per_client
    } else {
        0.0
    }
}

/// Fill `<R>` (round index) and `<C>` (1-based client index) placeholders
pub(crate) fn resolve_path_template(template: &str, msg: &RoundMessage) -> PathBuf {
    let round = msg.round_idx.to_string();
    let client = (msg.client_idx + 1).to_string();
    let resolved = template
        .replace("<R>", &round)
        .replace("<r>", &round)
        .replace("<C>", &client)
        .replace("<c>", &client);
    PathBuf::from(resolved)
}

/// Trace file encodings shared by the record and replay controllers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    /// Newline-delimited decimal milliseconds
    Text,
    /// u32 count followed by u32 values, little-endian
    BinLe,
    /// u32 count followed by u32 values, big-endian
    BinBe,
}

impl TraceFormat {
    /// Parse a format name case-insensitively, falling back to `Text`
    pub fn parse_or_text(name: Option<&str>) -> Self {
        match name.map(str::to_ascii_uppercase).as_deref() {
            Some("BIN_LE") => TraceFormat::BinLe,
            Some("BIN_BE") => TraceFormat::BinBe,
            Some("TEXT") | None => TraceFormat::Text,
            Some(other) => {
                tracing::warn!(format = other, "Unsupported trace format, using TEXT");
                TraceFormat::Text
            }
        }
    }

    pub fn encode(&self, records: &[u32]) -> Vec<u8> {
        match self {
            TraceFormat::Text => {
                let mut out = String::with_capacity(records.len() * 6);
                for r in records {
                    out.push_str(&r.to_string());
                    out.push('\n');
                }
                out.into_bytes()
            }
            TraceFormat::BinLe | TraceFormat::BinBe => {
                let mut out = Vec::with_capacity((records.len() + 1) * 4);
                let count = records.len() as u32;
                let push = |out: &mut Vec<u8>, v: u32| match self {
                    TraceFormat::BinLe => out.extend_from_slice(&v.to_le_bytes()),
                    _ => out.extend_from_slice(&v.to_be_bytes()),
                };
                push(&mut out, count);
                for &r in records {
                    push(&mut out, r);
                }
                out
            }
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<u32>, String> {
        match self {
            TraceFormat::Text => {
                let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(|l| l.parse::<u32>().map_err(|e| format!("bad record '{}': {}", l, e)))
                    .collect()
            }
            TraceFormat::BinLe | TraceFormat::BinBe => {
                let read = |chunk: &[u8]| {
                    let word = [chunk[0], chunk[1], chunk[2], chunk[3]];
                    match self {
                        TraceFormat::BinLe => u32::from_le_bytes(word),
                        _ => u32::from_be_bytes(word),
                    }
                };
                if bytes.len() < 4 {
                    return Err("missing record count".to_string());
                }
                let count = read(&bytes[..4]) as usize;
                let body = &bytes[4..];
                if body.len() < count * 4 {
                    return Err(format!("expected {} records, file holds {}", count, body.len() / 4));
                }
                Ok(body.chunks_exact(4).take(count).map(read).collect())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Controller that records what it was called with and never sleeps
    #[derive(Debug, Default)]
    pub struct Recorder {
        pub calls: std::sync::Arc<std::sync::Mutex<Vec<(u64, u128)>>>,
        pub ended: std::sync::Arc<std::sync::atomic::AtomicUsize>,
        pub init_msgs: std::sync::Arc<std::sync::Mutex<Vec<RoundMessage>>>,
    }

    #[async_trait]
    impl RateController for Recorder {
        fn init(&mut self, msg: &RoundMessage) -> Result<(), RateControlError> {
            self.init_msgs.lock().unwrap().push(msg.clone());
            Ok(())
        }

        async fn apply_rate_control(&mut self, start: Instant, idx: u64, _: &[TxStatus], _: &[TxStats]) {
            self.calls.lock().unwrap().push((idx, start.elapsed().as_millis()));
        }

        async fn end(&mut self) -> crate::Result<()> {
            self.ended.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_builtins() {
        let registry = RateControllerRegistry::default();
        for kind in [
            "fixed-rate",
            "zero-rate",
            "pid-rate",
            "composite-rate",
            "record-rate",
            "replay-rate",
            "fixed-feedback-rate",
            "linear-rate",
            "fixed-backlog",
        ] {
            assert!(registry.contains(kind), "missing {}", kind);
        }
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = RateControllerRegistry::default();
        let err = registry
            .create(&RateControlSpec::new("maximum-warp", serde_json::Value::Null))
            .err()
            .unwrap();
        assert!(matches!(err, RateControlError::UnknownType(ref t) if t == "maximum-warp"));
    }

    #[test]
    fn test_registry_custom_type() {
        fn make(_: &serde_json::Value, _: &RateControllerRegistry) -> Result<Box<dyn RateController>, RateControlError> {
            Ok(Box::new(test_support::Recorder::default()))
        }

        let mut registry = RateControllerRegistry::new();
        assert!(!registry.contains("recording"));
        registry.register("recording", make);
        assert!(registry.create(&RateControlSpec::new("recording", serde_json::Value::Null)).is_ok());
        assert_eq!(registry.types(), vec!["recording"]);
    }

    #[test]
    fn test_options() {
        let value = serde_json::json!({"tps": "25", "rate": 2.5, "zero": 0, "flag": true, "name": "x"});
        let opts = Options::new("test", &value);
        assert_eq!(opts.f64("tps").unwrap(), Some(25.0));
        assert_eq!(opts.require_f64("rate").unwrap(), 2.5);
        assert_eq!(opts.f64_or("zero", 7.0).unwrap(), 7.0);
        assert_eq!(opts.f64_or("missing", 3.0).unwrap(), 3.0);
        assert!(opts.bool("flag"));
        assert!(!opts.bool("missing"));
        assert_eq!(opts.str("name"), Some("x"));
        assert!(opts.require_f64("missing").is_err());

        let bad = serde_json::json!({"tps": [1]});
        assert!(Options::new("test", &bad).f64("tps").is_err());
    }

    #[test]
    fn test_sleep_time_per_client() {
        let mut msg = RoundMessage::count("r", 10);
        msg.total_clients = 4;
        assert_eq!(sleep_time_per_client(40.0, &msg), 100.0);
        assert_eq!(sleep_time_per_client(0.0, &msg), 0.0);
    }

    #[test]
    fn test_resolve_path_template() {
        let mut msg = RoundMessage::count("r", 10);
        msg.round_idx = 3;
        msg.client_idx = 0;
        assert_eq!(
            resolve_path_template("/tmp/trace_<R>_<c>.txt", &msg),
            PathBuf::from("/tmp/trace_3_1.txt")
        );
    }

    #[test]
    fn test_trace_formats() {
        let records = vec![0, 100, 200, 65_536];
        for format in [TraceFormat::Text, TraceFormat::BinLe, TraceFormat::BinBe] {
            let bytes = format.encode(&records);
            assert_eq!(format.decode(&bytes).unwrap(), records);
        }

        let le = TraceFormat::BinLe.encode(&[1]);
        assert_eq!(le, vec![1, 0, 0, 0, 1, 0, 0, 0]);
        let be = TraceFormat::BinBe.encode(&[1]);
        assert_eq!(be, vec![0, 0, 0, 1, 0, 0, 0, 1]);
        assert_eq!(TraceFormat::Text.encode(&[5, 7]), b"5\n7\n".to_vec());

        assert!(TraceFormat::BinLe.decode(&[2, 0, 0, 0, 1, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_trace_format_parse() {
        assert_eq!(TraceFormat::parse_or_text(Some("bin_le")), TraceFormat::BinLe);
        assert_eq!(TraceFormat::parse_or_text(Some("BIN_BE")), TraceFormat::BinBe);
        assert_eq!(TraceFormat::parse_or_text(Some("csv")), TraceFormat::Text);
        assert_eq!(TraceFormat::parse_or_text(None), TraceFormat::Text);
    }
}
