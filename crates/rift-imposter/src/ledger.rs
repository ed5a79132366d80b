//! Per-imposter request ledger.
//!
//! Append-only record of every request an imposter received together with the
//! stub that answered it and what was sent back. Readers take a snapshot so
//! inspection never blocks connection handlers for long.

use crate::message::Request;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// How a request was resolved.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Outcome {
    /// A stub matched and produced this reply
    Response { response: serde_json::Value },
    /// No stub matched; the imposter default was used
    Default { response: serde_json::Value },
    /// The matched response asked for a connection fault
    Fault { fault: String },
    /// Resolution failed for this request only
    Error { message: String },
    /// An injection or proxy round trip exceeded its bounded wait
    #[serde(rename_all = "camelCase")]
    Timeout { after_ms: u64 },
    /// Record-only protocols (smtp) accept without replying
    Accepted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub request: Request,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stub_id: Option<u64>,
    pub outcome: Outcome,
}

impl LedgerEntry {
    pub fn new(request: Request, stub_id: Option<u64>, outcome: Outcome) -> Self {
        Self {
            timestamp: Utc::now(),
            request,
            stub_id,
            outcome,
        }
    }
}

#[derive(Debug, Default)]
pub struct RequestLedger {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: LedgerEntry) {
        self.entries.write().push(entry);
    }

    /// Copy of every entry recorded so far, in arrival order.
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Mode, TcpRequest};
    use bytes::Bytes;
    use std::sync::Arc;

    fn tcp(data: &'static str) -> Request {
        Request::Tcp(TcpRequest::new("127.0.0.1:1", Bytes::from_static(data.as_bytes()), Mode::Text))
    }

    #[test]
    fn test_append_preserves_order() {
        let ledger = RequestLedger::new();
        assert!(ledger.is_empty());
        ledger.append(LedgerEntry::new(tcp("a"), Some(1), Outcome::Accepted));
        ledger.append(LedgerEntry::new(tcp("b"), None, Outcome::Accepted));

        let entries = ledger.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stub_id, Some(1));
        assert_eq!(entries[1].request.to_json()["data"], "b");
    }

    #[test]
    fn test_outcome_serializes_with_type_tag() {
        let json = serde_json::to_value(Outcome::Timeout { after_ms: 50 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "timeout", "afterMs": 50}));
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let ledger = Arc::new(RequestLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        ledger.append(LedgerEntry::new(tcp("x"), None, Outcome::Accepted));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.len(), 800);
    }
}
