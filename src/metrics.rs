// src/metrics.rs
// Process-wide counters exported as Prometheus text or JSON.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub static METRICS: Lazy<ChainMetrics> = Lazy::new(ChainMetrics::new);

pub struct ChainMetrics {
    pub rounds_opened: AtomicU64,
    pub rounds_finalized: AtomicU64,
    pub rounds_timed_out: AtomicU64,
    pub votes_accepted: AtomicU64,
    pub votes_rejected: AtomicU64,
    pub blocks_appended: AtomicU64,
    pub blocks_rejected: AtomicU64,
    pub anchors_submitted: AtomicU64,
    pub anchors_deduplicated: AtomicU64,
    pub chain_height: AtomicU64,
    start_time: Instant,
}

impl ChainMetrics {
    fn new() -> Self {
        Self {
            rounds_opened: AtomicU64::new(0),
            rounds_finalized: AtomicU64::new(0),
            rounds_timed_out: AtomicU64::new(0),
            votes_accepted: AtomicU64::new(0),
            votes_rejected: AtomicU64::new(0),
            blocks_appended: AtomicU64::new(0),
            blocks_rejected: AtomicU64::new(0),
            anchors_submitted: AtomicU64::new(0),
            anchors_deduplicated: AtomicU64::new(0),
            chain_height: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_chain_height(&self, height: u64) {
        self.chain_height.store(height, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn rows(&self) -> [(&'static str, &'static str, &'static str, u64); 10] {
        let l = |c: &AtomicU64| c.load(Ordering::Relaxed);
        [
            ("lucid_rounds_opened_total", "counter", "Consensus rounds opened", l(&self.rounds_opened)),
            ("lucid_rounds_finalized_total", "counter", "Rounds that reached quorum", l(&self.rounds_finalized)),
            ("lucid_rounds_timed_out_total", "counter", "Rounds that hit their deadline", l(&self.rounds_timed_out)),
            ("lucid_votes_accepted_total", "counter", "Votes counted toward a tally", l(&self.votes_accepted)),
            ("lucid_votes_rejected_total", "counter", "Votes rejected before counting", l(&self.votes_rejected)),
            ("lucid_blocks_appended_total", "counter", "Blocks appended to the chain", l(&self.blocks_appended)),
            ("lucid_blocks_rejected_total", "counter", "Blocks that failed validation", l(&self.blocks_rejected)),
            ("lucid_anchors_submitted_total", "counter", "Session anchors entering the pool", l(&self.anchors_submitted)),
            ("lucid_anchors_deduplicated_total", "counter", "Anchor retries answered with an existing record", l(&self.anchors_deduplicated)),
            ("lucid_chain_height", "gauge", "Height of the latest block", l(&self.chain_height)),
        ]
    }

    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, kind, help, value) in self.rows() {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n\n"
            ));
        }
        out
    }

    pub fn export_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, _, _, value) in self.rows() {
            map.insert(name.to_string(), value.into());
        }
        map.insert("uptime_secs".into(), self.uptime_secs().into());
        serde_json::Value::Object(map)
    }
}
