//! In-memory traffic accounting.
//!
//! The proxies feed two lightweight structures alongside the durable
//! rollups: a per-tunnel counter map and a bounded rolling log of recent
//! traffic. Both are snapshot-copied for reporting so the hot path only
//! ever holds the lock for a map touch.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Aggregate counters for one tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Mutex-guarded per-tunnel counters.
#[derive(Default)]
pub struct Collector {
    by_tunnel: Mutex<HashMap<String, Counters>>,
}

impl Collector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tunnel_id: &str, requests: u64, bytes_in: u64, bytes_out: u64) {
        if tunnel_id.is_empty() {
            return;
        }
        let mut map = self.by_tunnel.lock().expect("metrics lock poisoned");
        let entry = map.entry(tunnel_id.to_string()).or_default();
        entry.requests += requests;
        entry.bytes_in += bytes_in;
        entry.bytes_out += bytes_out;
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Counters> {
        self.by_tunnel.lock().expect("metrics lock poisoned").clone()
    }
}

/// One recent traffic event, kept in memory only.
#[derive(Debug, Clone)]
pub struct TrafficEvent {
    pub tunnel_id: String,
    pub timestamp: DateTime<Utc>,
    pub remote_addr: String,
    pub summary: String,
    pub status: Option<u16>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Bounded rolling log of recent traffic events.
pub struct RollingLog {
    inner: Mutex<Vec<TrafficEvent>>,
    max: usize,
}

impl RollingLog {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            max: if max == 0 { 1000 } else { max },
        }
    }

    pub fn push(&self, event: TrafficEvent) {
        let mut log = self.inner.lock().expect("rolling log lock poisoned");
        log.push(event);
        if log.len() > self.max {
            let overflow = log.len() - self.max;
            log.drain(..overflow);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<TrafficEvent> {
        self.inner.lock().expect("rolling log lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_accumulates_per_tunnel() {
        let collector = Collector::new();
        collector.add("t1", 1, 10, 20);
        collector.add("t1", 1, 5, 5);
        collector.add("t2", 0, 1, 1);
        collector.add("", 9, 9, 9);

        let snap = collector.snapshot();
        assert_eq!(
            snap["t1"],
            Counters {
                requests: 2,
                bytes_in: 15,
                bytes_out: 25
            }
        );
        assert_eq!(snap["t2"].requests, 0);
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn test_rolling_log_bounded() {
        let log = RollingLog::new(3);
        for i in 0..5u16 {
            log.push(TrafficEvent {
                tunnel_id: "t1".to_string(),
                timestamp: Utc::now(),
                remote_addr: "1.2.3.4:1".to_string(),
                summary: format!("event {i}"),
                status: Some(200),
                bytes_in: 0,
                bytes_out: 0,
            });
        }
        let snap = log.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].summary, "event 2");
        assert_eq!(snap[2].summary, "event 4");
    }
}
