//! Counter and gauge sink behind the `/metrics` endpoint.
//!
//! The sink is an explicit value handed to whoever records into it rather
//! than a process-wide registry, so tests can instantiate and inspect their
//! own. Counters and gauges are atomics; `render` serializes them under the
//! names the endpoint has always exposed.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Mutex,
};

use serde_json::{json, Value};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The control plane's metric sink.
#[derive(Debug, Default)]
pub struct Metrics {
    creates: AtomicI64,
    create_warm_hits: AtomicI64,
    create_colds: AtomicI64,
    execs: AtomicI64,
    deletes: AtomicI64,
    warm_pool_desired: AtomicI64,
    warm_pool_ready: AtomicI64,
    stream_buffer: AtomicI64,
    cache_mode: Mutex<String>,
    create_ready_total_ms: AtomicI64,
    create_ready_count: AtomicI64,
    create_ready_last_ms: AtomicI64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Metrics {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one sandbox create, split by warm hit vs cold provision.
    pub fn record_create(&self, warm_hit: bool) {
        self.creates.fetch_add(1, Ordering::Relaxed);
        if warm_hit {
            self.create_warm_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.create_colds.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts one exec dispatch.
    pub fn record_exec(&self) {
        self.execs.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one sandbox delete.
    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Updates the warm pool gauges.
    pub fn set_warm_pool(&self, desired: i64, ready: i64) {
        self.warm_pool_desired.store(desired, Ordering::Relaxed);
        self.warm_pool_ready.store(ready, Ordering::Relaxed);
    }

    /// Records the configured stream ring size.
    pub fn set_stream_buffer(&self, size: i64) {
        self.stream_buffer.store(size, Ordering::Relaxed);
    }

    /// Records the configured cache mode.
    pub fn set_cache_mode(&self, mode: &str) {
        *self.cache_mode.lock().unwrap() = mode.to_string();
    }

    /// Records one create-to-ready latency sample.
    pub fn record_create_ready(&self, millis: i64) {
        self.create_ready_total_ms.fetch_add(millis, Ordering::Relaxed);
        self.create_ready_count.fetch_add(1, Ordering::Relaxed);
        self.create_ready_last_ms.store(millis, Ordering::Relaxed);
    }

    /// The current warm-hit counter value.
    pub fn warm_hits(&self) -> i64 {
        self.create_warm_hits.load(Ordering::Relaxed)
    }

    /// Serializes every counter and gauge.
    pub fn render(&self) -> Value {
        let count = self.create_ready_count.load(Ordering::Relaxed);
        let avg = if count == 0 {
            0
        } else {
            self.create_ready_total_ms.load(Ordering::Relaxed) / count
        };
        json!({
            "sandbox_create_total": self.creates.load(Ordering::Relaxed),
            "sandbox_create_warm_hit_total": self.create_warm_hits.load(Ordering::Relaxed),
            "sandbox_create_cold_total": self.create_colds.load(Ordering::Relaxed),
            "sandbox_exec_total": self.execs.load(Ordering::Relaxed),
            "sandbox_delete_total": self.deletes.load(Ordering::Relaxed),
            "warm_pool_desired": self.warm_pool_desired.load(Ordering::Relaxed),
            "warm_pool_ready": self.warm_pool_ready.load(Ordering::Relaxed),
            "sandbox_stream_buffer": self.stream_buffer.load(Ordering::Relaxed),
            "sandbox_cache_mode": self.cache_mode.lock().unwrap().clone(),
            "sandbox_create_ready_ms_avg": avg,
            "sandbox_create_ready_ms_last": self.create_ready_last_ms.load(Ordering::Relaxed),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_counters_split_warm_and_cold() {
        let metrics = Metrics::new();
        metrics.record_create(true);
        metrics.record_create(false);
        metrics.record_create(false);

        let rendered = metrics.render();
        assert_eq!(rendered["sandbox_create_total"], 3);
        assert_eq!(rendered["sandbox_create_warm_hit_total"], 1);
        assert_eq!(rendered["sandbox_create_cold_total"], 2);
    }

    #[test]
    fn test_create_ready_avg_and_last() {
        let metrics = Metrics::new();
        assert_eq!(metrics.render()["sandbox_create_ready_ms_avg"], 0);

        metrics.record_create_ready(100);
        metrics.record_create_ready(300);
        let rendered = metrics.render();
        assert_eq!(rendered["sandbox_create_ready_ms_avg"], 200);
        assert_eq!(rendered["sandbox_create_ready_ms_last"], 300);
    }

    #[test]
    fn test_gauges() {
        let metrics = Metrics::new();
        metrics.set_warm_pool(4, 2);
        metrics.set_stream_buffer(200);
        metrics.set_cache_mode("pvc");

        let rendered = metrics.render();
        assert_eq!(rendered["warm_pool_desired"], 4);
        assert_eq!(rendered["warm_pool_ready"], 2);
        assert_eq!(rendered["sandbox_stream_buffer"], 200);
        assert_eq!(rendered["sandbox_cache_mode"], "pvc");
    }
}
