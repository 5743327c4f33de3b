//! Bounded ledger of processed messages, used for redelivery dedup.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::actions::ActionTaken;

/// Latest known outcome for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Claimed by a worker, not finished yet.
    Pending,
    Allowed,
    WouldDelete,
    Flagged,
    Archived,
    Deleted,
    DeleteFailed,
    NotifySent,
    NotifyFailed,
    /// Channel is not monitored.
    Skipped,
    /// Processing gave up on the message.
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Allowed => "allowed",
            Self::WouldDelete => "would_delete",
            Self::Flagged => "flagged",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
            Self::DeleteFailed => "delete_failed",
            Self::NotifySent => "notify_sent",
            Self::NotifyFailed => "notify_failed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ActionTaken> for Outcome {
    fn from(action: ActionTaken) -> Self {
        match action {
            ActionTaken::Allowed => Self::Allowed,
            ActionTaken::WouldDelete => Self::WouldDelete,
            ActionTaken::Deleted => Self::Deleted,
            ActionTaken::DeleteFailed => Self::DeleteFailed,
            ActionTaken::Flagged => Self::Flagged,
            ActionTaken::Archived => Self::Archived,
        }
    }
}

/// Per-message idempotency marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingRecord {
    /// `channel_id/message_id`.
    pub message_key: String,
    pub outcome: Outcome,
    pub processed_at: DateTime<Utc>,
}

struct LedgerInner {
    records: HashMap<String, ProcessingRecord>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

/// Fixed-capacity set of processed message keys with their outcomes.
///
/// `try_claim` is an atomic insert-if-absent, so two workers handed the same
/// redelivered message cannot both process it. When full, the oldest record
/// is evicted.
pub struct ProcessedLedger {
    inner: Mutex<LedgerInner>,
    capacity: usize,
}

impl ProcessedLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(LedgerInner {
                records: HashMap::with_capacity(capacity.min(1024)),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerInner> {
        // Records stay valid even if a holder panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `key` for processing. Returns false when it was already seen.
    pub fn try_claim(&self, key: &str) -> bool {
        let mut inner = self.lock();
        if inner.records.contains_key(key) {
            return false;
        }

        while inner.order.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.records.remove(&oldest);
                }
                None => break,
            }
        }

        inner.order.push_back(key.to_string());
        inner.records.insert(
            key.to_string(),
            ProcessingRecord {
                message_key: key.to_string(),
                outcome: Outcome::Pending,
                processed_at: Utc::now(),
            },
        );
        true
    }

    /// Update the outcome of a claimed key. Keys evicted in the meantime are
    /// not re-added.
    pub fn record(&self, key: &str, outcome: Outcome) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(key) {
            record.outcome = outcome;
            record.processed_at = Utc::now();
        }
    }

    pub fn get(&self, key: &str) -> Option<ProcessingRecord> {
        self.lock().records.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_claim_is_rejected() {
        let ledger = ProcessedLedger::new(10);
        assert!(ledger.try_claim("c/1"));
        assert!(!ledger.try_claim("c/1"));
        assert!(ledger.try_claim("c/2"));
        assert_eq!(ledger.get("c/1").unwrap().outcome, Outcome::Pending);
    }

    #[test]
    fn outcome_is_updated_in_place() {
        let ledger = ProcessedLedger::new(10);
        ledger.try_claim("c/1");
        ledger.record("c/1", Outcome::from(ActionTaken::Deleted));
        ledger.record("c/1", Outcome::NotifySent);
        assert_eq!(ledger.get("c/1").unwrap().outcome, Outcome::NotifySent);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn record_without_claim_is_ignored() {
        let ledger = ProcessedLedger::new(10);
        ledger.record("c/9", Outcome::Deleted);
        assert!(ledger.get("c/9").is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn oldest_entries_are_evicted_at_capacity() {
        let ledger = ProcessedLedger::new(2);
        assert!(ledger.try_claim("c/1"));
        assert!(ledger.try_claim("c/2"));
        assert!(ledger.try_claim("c/3"));
        assert_eq!(ledger.len(), 2);
        assert!(ledger.get("c/1").is_none());
        // Evicted key can be claimed again.
        assert!(ledger.try_claim("c/1"));
        assert!(ledger.get("c/2").is_none());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let ledger = Arc::new(ProcessedLedger::new(100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.try_claim("c/dup"))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(Outcome::DeleteFailed.to_string(), "delete_failed");
        assert_eq!(Outcome::from(ActionTaken::WouldDelete), Outcome::WouldDelete);
    }
}
