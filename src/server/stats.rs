//! Rolling request counters and a bounded ring of recent request log lines.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

const MAX_LOG_LINES: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogLine {
    pub at: String,
    pub method: String,
    pub path: String,
    pub status: u16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub recent: Vec<RequestLogLine>,
}

#[derive(Default)]
pub struct RequestStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    ring: Mutex<VecDeque<RequestLogLine>>,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, method: &str, path: &str, status: u16) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if status < 400 {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut ring = self.ring.lock().expect("stats ring poisoned");
        ring.push_back(RequestLogLine {
            at: Utc::now().to_rfc3339(),
            method: method.to_string(),
            path: path.to_string(),
            status,
        });
        while ring.len() > MAX_LOG_LINES {
            ring.pop_front();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let ring = self.ring.lock().expect("stats ring poisoned");
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            recent: ring.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_split_by_outcome() {
        let stats = RequestStats::new();
        stats.record("GET", "/api/summary", 200);
        stats.record("POST", "/api/ca/setup", 400);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.recent.len(), 2);
    }

    #[test]
    fn ring_is_bounded() {
        let stats = RequestStats::new();
        for i in 0..(MAX_LOG_LINES + 50) {
            stats.record("GET", &format!("/api/{i}"), 200);
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.recent.len(), MAX_LOG_LINES);
        assert_eq!(snapshot.recent[0].path, "/api/50");
    }
}
