//! Bounded per-domain time-decayed EWMA latency store (spec §3 `latencyTable`, §4.1 TD-EWMA).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct LatencySample {
    pub ewma: Duration,
    pub last_updated_ns: i64,
}

struct Inner {
    capacity: usize,
    samples: HashMap<String, LatencySample>,
    /// Recency order, oldest first. Small expected cardinality (authority +
    /// target domains per node), so a linear scan on touch is cheap enough
    /// to avoid an intrusive linked-list LRU.
    order: Vec<String>,
}

impl Inner {
    fn touch(&mut self, domain: &str) {
        if let Some(pos) = self.order.iter().position(|d| d == domain) {
            let d = self.order.remove(pos);
            self.order.push(d);
        } else {
            self.order.push(domain.to_string());
        }
    }

    fn evict_one_if_needed(&mut self, incoming_is_new: bool) {
        if incoming_is_new && self.samples.len() >= self.capacity && !self.order.is_empty() {
            let victim = self.order.remove(0);
            self.samples.remove(&victim);
        }
    }
}

/// A bounded, per-node map of normalized domain -> time-decayed EWMA latency.
/// `capacity == 0` disables recording entirely.
pub struct LatencyTable {
    inner: Mutex<Inner>,
}

impl LatencyTable {
    pub fn new(capacity: usize) -> Self {
        LatencyTable {
            inner: Mutex::new(Inner {
                capacity,
                samples: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn get(&self, domain: &str) -> Option<LatencySample> {
        self.inner.lock().samples.get(domain).copied()
    }

    /// Applies a new sample with time-decayed EWMA smoothing. Returns
    /// `true` if the table transitioned empty -> non-empty (the pool uses
    /// this to know when to notify platforms that the latency filter
    /// threshold might now be crossed).
    ///
    /// `decay_window_ns <= 0` disables decay: the new sample replaces the
    /// old one outright, guarding against a division by zero in the
    /// `exp(-dt/decayWindow)` weight.
    pub fn record(
        &self,
        domain: &str,
        latency: Duration,
        now_ns: i64,
        decay_window_ns: i64,
    ) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let mut inner = self.inner.lock();
        let was_empty = inner.samples.is_empty();
        let is_new = !inner.samples.contains_key(domain);
        inner.evict_one_if_needed(is_new);

        let ewma = match inner.samples.get(domain) {
            None => latency,
            Some(prev) => {
                if decay_window_ns <= 0 {
                    latency
                } else {
                    let dt = (now_ns - prev.last_updated_ns).max(0) as f64;
                    let w = (-dt / decay_window_ns as f64).exp();
                    let prev_secs = prev.ewma.as_secs_f64();
                    let lat_secs = latency.as_secs_f64();
                    Duration::from_secs_f64((prev_secs * w + lat_secs * (1.0 - w)).max(0.0))
                }
            }
        };
        inner.samples.insert(
            domain.to_string(),
            LatencySample {
                ewma,
                last_updated_ns: now_ns,
            },
        );
        inner.touch(domain);
        was_empty && !inner.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_disables_recording() {
        let t = LatencyTable::new(0);
        t.record("example.com", Duration::from_millis(50), 0, 1_000_000_000);
        assert!(t.is_empty());
    }

    #[test]
    fn first_record_stores_directly() {
        let t = LatencyTable::new(4);
        let became_non_empty = t.record("example.com", Duration::from_millis(50), 0, 1_000_000_000);
        assert!(became_non_empty);
        assert_eq!(t.get("example.com").unwrap().ewma, Duration::from_millis(50));
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let t = LatencyTable::new(2);
        t.record("a.com", Duration::from_millis(10), 0, 1_000_000_000);
        t.record("b.com", Duration::from_millis(10), 1, 1_000_000_000);
        assert_eq!(t.len(), 2);
        // a.com is least-recently-used; inserting a third domain evicts it.
        t.record("c.com", Duration::from_millis(10), 2, 1_000_000_000);
        assert_eq!(t.len(), 2);
        assert!(t.get("a.com").is_none());
        assert!(t.get("b.com").is_some());
        assert!(t.get("c.com").is_some());
    }

    #[test]
    fn touching_existing_domain_does_not_evict() {
        let t = LatencyTable::new(2);
        t.record("a.com", Duration::from_millis(10), 0, 1_000_000_000);
        t.record("b.com", Duration::from_millis(10), 1, 1_000_000_000);
        t.record("a.com", Duration::from_millis(20), 2, 1_000_000_000);
        assert_eq!(t.len(), 2);
        assert!(t.get("a.com").is_some());
        assert!(t.get("b.com").is_some());
    }

    #[test]
    fn decay_window_guard_replaces_outright() {
        let t = LatencyTable::new(4);
        t.record("example.com", Duration::from_millis(100), 0, 0);
        t.record("example.com", Duration::from_millis(10), 1, 0);
        assert_eq!(t.get("example.com").unwrap().ewma, Duration::from_millis(10));
    }

    #[test]
    fn decay_weights_toward_recent_sample_over_time() {
        let t = LatencyTable::new(4);
        let decay = 1_000_000_000i64; // 1s
        t.record("example.com", Duration::from_millis(100), 0, decay);
        // a long time later, the new sample should dominate
        t.record("example.com", Duration::from_millis(10), 100 * decay, decay);
        let sample = t.get("example.com").unwrap();
        assert!(sample.ewma < Duration::from_millis(15));
    }
}
