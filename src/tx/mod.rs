//! Per-transaction outcome records
//!
//! A [`TxStatus`] is created by an adapter when a transaction is submitted and is
//! owned by the worker runner until the round's statistics are computed. The
//! final timestamp stays at zero until the status leaves [`Status::Created`].
//! The `verified` flag is independent of the status: a transaction can be marked
//! successful from the submission path while still awaiting an out-of-band
//! confirmation.

use crate::util::time::now_millis;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Created,
    Success,
    Failed,
}

/// Canonical per-transaction outcome record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxStatus {
    /// Transaction identifier (adapter defined)
    pub id: String,

    pub status: Status,

    /// Submission time, milliseconds since the epoch
    pub time_create: u64,

    /// Finalization time, milliseconds since the epoch (0 while created)
    pub time_final: u64,

    /// Opaque adapter result payload
    #[serde(default)]
    pub result: serde_json::Value,

    /// Set once an independent confirmation source has observed the outcome
    #[serde(default)]
    pub verified: bool,

    /// Adapter-defined flags
    #[serde(default)]
    pub flags: i64,

    /// Error messages indexed by adapter-defined error category
    #[serde(default)]
    pub error_messages: Vec<String>,
}

impl TxStatus {
    /// Create a new record in the `created` state, stamped with the current time
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_create_time(id, now_millis())
    }

    /// Create a new record with an explicit submission time
    pub fn with_create_time(id: impl Into<String>, time_create: u64) -> Self {
        Self {
            id: id.into(),
            status: Status::Created,
            time_create,
            time_final: 0,
            result: serde_json::Value::Null,
            verified: false,
            flags: 0,
            error_messages: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_committed(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_finished(&self) -> bool {
        self.status != Status::Created
    }

    /// Mark the transaction successful, stamping the final time if not yet set
    pub fn set_success(&mut self) {
        self.finish(Status::Success, now_millis());
    }

    /// Mark the transaction successful at a known time
    pub fn set_success_at(&mut self, time_final: u64) {
        self.finish(Status::Success, time_final);
    }

    /// Mark the transaction failed, stamping the final time if not yet set
    pub fn set_failed(&mut self) {
        self.finish(Status::Failed, now_millis());
    }

    pub fn set_failed_at(&mut self, time_final: u64) {
        self.finish(Status::Failed, time_final);
    }

    fn finish(&mut self, status: Status, time_final: u64) {
        self.status = status;
        self.time_final = time_final;
    }

    /// Latency in milliseconds, if the transaction has finished
    pub fn delay_millis(&self) -> Option<u64> {
        if self.is_finished() {
            Some(self.time_final.saturating_sub(self.time_create))
        } else {
            None
        }
    }

    pub fn set_result(&mut self, result: serde_json::Value) {
        self.result = result;
    }

    pub fn result(&self) -> &serde_json::Value {
        &self.result
    }

    pub fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn set_flag(&mut self, flags: i64) {
        self.flags = flags;
    }

    pub fn flags(&self) -> i64 {
        self.flags
    }

    /// Store an error message under the given category, growing the list as needed
    pub fn set_error_message(&mut self, idx: usize, message: impl Into<String>) {
        if self.error_messages.len() <= idx {
            self.error_messages.resize(idx + 1, String::new());
        }
        self.error_messages[idx] = message.into();
    }

    pub fn error_message(&self, idx: usize) -> Option<&str> {
        self.error_messages
            .get(idx)
            .map(String::as_str)
            .filter(|m| !m.is_empty())
    }

    pub fn error_messages(&self) -> &[String] {
        &self.error_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_status_is_created() {
        let tx = TxStatus::new("tx1");
        assert_eq!(tx.id(), "tx1");
        assert_eq!(tx.status(), Status::Created);
        assert!(tx.time_create > 0);
        assert_eq!(tx.time_final, 0);
        assert!(!tx.is_verified());
        assert_eq!(tx.delay_millis(), None);
    }

    #[test]
    fn test_success_sets_final_time() {
        let mut tx = TxStatus::with_create_time("tx1", 1_000);
        tx.set_success_at(1_250);
        assert!(tx.is_committed());
        assert_eq!(tx.time_final, 1_250);
        assert_eq!(tx.delay_millis(), Some(250));
        // Success from the submission path alone does not verify
        assert!(!tx.is_verified());
    }

    #[test]
    fn test_failed() {
        let mut tx = TxStatus::with_create_time("tx2", 1_000);
        tx.set_failed_at(1_100);
        assert_eq!(tx.status(), Status::Failed);
        assert!(tx.is_finished());
        assert!(!tx.is_committed());
    }

    #[test]
    fn test_error_messages_grow() {
        let mut tx = TxStatus::new("tx3");
        tx.set_error_message(2, "endorsement mismatch");
        assert_eq!(tx.error_messages().len(), 3);
        assert_eq!(tx.error_message(0), None);
        assert_eq!(tx.error_message(2), Some("endorsement mismatch"));
        assert_eq!(tx.error_message(5), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let tx = TxStatus::with_create_time("tx4", 5);
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["status"], "created");
        assert_eq!(json["time_final"], 0);
    }
}
