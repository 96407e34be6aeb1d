use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

/// Default number of calls kept.
pub const DEFAULT_CALL_LOG_CAPACITY: usize = 50;

/// One successful call as answered to the caller, or a broadcast applied to one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CallLogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub endpoint_url: String,
    pub member: String,
    pub args: Value,
    /// `true` if the response was produced locally without a round trip.
    pub cached: bool,
    pub response: Value,
}

/// Bounded record of recent calls, oldest evicted first.
pub struct CallLog {
    entries: RwLock<VecDeque<CallLogEntry>>,
    max_size: usize,
    next_id: AtomicU64,
}

impl CallLog {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_size)),
            max_size,
            next_id: AtomicU64::new(1),
        }
    }

    /// Appends an entry and returns its id.
    pub fn record(
        &self,
        endpoint_url: &str,
        member: &str,
        args: Value,
        cached: bool,
        response: Value,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = CallLogEntry {
            id,
            timestamp: Utc::now(),
            endpoint_url: endpoint_url.to_string(),
            member: member.to_string(),
            args,
            cached,
            response,
        };

        let mut entries = self.entries.write();
        if self.max_size == 0 {
            return id;
        }
        if entries.len() >= self.max_size {
            entries.pop_front();
        }
        entries.push_back(entry);
        id
    }

    /// Snapshot of the retained entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<CallLogEntry> {
        self.entries.read().iter().cloned().collect()
    }

    #[must_use]
    pub fn latest(&self) -> Option<CallLogEntry> {
        self.entries.read().back().cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for CallLog {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_LOG_CAPACITY)
    }
}

impl std::fmt::Debug for CallLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLog")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}
