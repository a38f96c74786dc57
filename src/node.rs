//! Node identity and per-node static/dynamic state (spec §3 `NE`, §4.1 egress
//! region state machine).

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::hash::NodeHash;
use crate::latency::LatencyTable;

/// IP or IP+port network family a dial targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

/// A bidirectional byte stream handed back by an outbound dialer.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncDuplex for T {}

pub type BoxedDuplex = Box<dyn AsyncDuplex>;

/// An opaque capability to open a connection through a proxy node. The
/// concrete protocol (shadowsocks/vmess/trojan/...) lives entirely outside
/// this crate; the core only ever calls `connect`.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn connect(&self, network: Network, addr: &str) -> std::io::Result<BoxedDuplex>;
}

#[derive(Clone, Default)]
pub struct EgressState {
    pub ip: Option<IpAddr>,
    pub region: Option<String>,
}

/// Outcome of `NodeEntry::record_result`, telling the pool whether to fan
/// out a dirty notification.
pub struct RecordOutcome {
    pub dynamic_changed: bool,
    pub circuit_changed: bool,
}

/// Outcome of `NodeEntry::update_egress_ip`.
pub struct EgressUpdateOutcome {
    pub notify: bool,
}

/// Static + dynamic state for one pool node.
pub struct NodeEntry {
    hash: NodeHash,
    raw_options: Vec<u8>,
    created_at_ns: i64,

    /// Subscription ids that currently reference this node. The pool
    /// deletes the entry once this becomes empty; the mutation and the
    /// emptiness check happen together under the pool's map-entry compute,
    /// not here.
    ref_set: Mutex<HashSet<String>>,

    failure_count: AtomicU32,
    circuit_open_since_ns: AtomicI64,
    egress: ArcSwap<EgressState>,
    last_egress_update_ns: AtomicI64,
    last_egress_update_attempt_ns: AtomicI64,
    last_latency_probe_attempt_ns: AtomicI64,
    last_authority_latency_probe_attempt_ns: AtomicI64,
    outbound: ArcSwapOption<dyn Outbound>,
    latency_table: LatencyTable,
}

impl fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEntry")
            .field("hash", &self.hash)
            .field("failure_count", &self.failure_count.load(Ordering::Relaxed))
            .field("circuit_open_since_ns", &self.circuit_open_since_ns.load(Ordering::Relaxed))
            .finish()
    }
}

impl NodeEntry {
    pub fn new(hash: NodeHash, raw_options: Vec<u8>, created_at_ns: i64, latency_capacity: usize) -> Self {
        NodeEntry {
            hash,
            raw_options,
            created_at_ns,
            ref_set: Mutex::new(HashSet::new()),
            failure_count: AtomicU32::new(0),
            circuit_open_since_ns: AtomicI64::new(0),
            egress: ArcSwap::from_pointee(EgressState::default()),
            last_egress_update_ns: AtomicI64::new(0),
            last_egress_update_attempt_ns: AtomicI64::new(0),
            last_latency_probe_attempt_ns: AtomicI64::new(0),
            last_authority_latency_probe_attempt_ns: AtomicI64::new(0),
            outbound: ArcSwapOption::empty(),
            latency_table: LatencyTable::new(latency_capacity),
        }
    }

    pub fn hash(&self) -> NodeHash {
        self.hash
    }

    pub fn raw_options(&self) -> &[u8] {
        &self.raw_options
    }

    pub fn created_at_ns(&self) -> i64 {
        self.created_at_ns
    }

    pub fn latency_table(&self) -> &LatencyTable {
        &self.latency_table
    }

    // -- reference set --------------------------------------------------

    /// Adds `sub_id` to the reference set. Returns `true` if this added a
    /// new reference (idempotent: adding the same id twice only counts once).
    pub fn add_ref(&self, sub_id: &str) -> bool {
        self.ref_set.lock().insert(sub_id.to_string())
    }

    /// Removes `sub_id` from the reference set. Returns `true` if it was
    /// present (a no-op, returning `false`, otherwise).
    pub fn remove_ref(&self, sub_id: &str) -> bool {
        self.ref_set.lock().remove(sub_id)
    }

    pub fn ref_count(&self) -> usize {
        self.ref_set.lock().len()
    }

    pub fn referencing_subs(&self) -> Vec<String> {
        self.ref_set.lock().iter().cloned().collect()
    }

    // -- circuit breaker --------------------------------------------------

    pub fn is_circuit_open(&self) -> bool {
        self.circuit_open_since_ns.load(Ordering::Acquire) != 0
    }

    pub fn circuit_open_since_ns(&self) -> i64 {
        self.circuit_open_since_ns.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Applies a probe result. `threshold` is pulled fresh on every call
    /// (spec: "via a supplied function each call, to support hot reload").
    pub fn record_result(&self, success: bool, now_ns: i64, threshold: u32) -> RecordOutcome {
        if success {
            let prev_failures = self.failure_count.swap(0, Ordering::AcqRel);
            let prev_circuit = self.circuit_open_since_ns.swap(0, Ordering::AcqRel);
            let circuit_changed = prev_circuit != 0;
            RecordOutcome {
                dynamic_changed: prev_failures != 0 || circuit_changed,
                circuit_changed,
            }
        } else {
            let new_count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
            let mut circuit_changed = false;
            if new_count >= threshold {
                circuit_changed = self
                    .circuit_open_since_ns
                    .compare_exchange(0, now_ns, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
            }
            RecordOutcome {
                dynamic_changed: true,
                circuit_changed,
            }
        }
    }

    // -- egress ----------------------------------------------------------

    pub fn egress(&self) -> Arc<EgressState> {
        self.egress.load_full()
    }

    pub fn last_egress_update_ns(&self) -> i64 {
        self.last_egress_update_ns.load(Ordering::Acquire)
    }

    pub fn last_egress_update_attempt_ns(&self) -> i64 {
        self.last_egress_update_attempt_ns.load(Ordering::Acquire)
    }

    /// Egress region state machine (spec §4.1):
    /// - `loc` present & non-empty -> store lowercase-trimmed loc
    /// - `loc` nil & ip changed -> clear region (geo fallback refills on demand)
    /// - `loc` nil & ip unchanged -> keep region
    pub fn update_egress_ip(&self, ip: Option<IpAddr>, loc: Option<String>, now_ns: i64) -> EgressUpdateOutcome {
        self.last_egress_update_attempt_ns.store(now_ns, Ordering::Release);
        let Some(ip) = ip else {
            return EgressUpdateOutcome { notify: false };
        };
        self.last_egress_update_ns.store(now_ns, Ordering::Release);

        let prev = self.egress.load();
        let ip_changed = prev.ip != Some(ip);
        let trimmed_loc = loc.map(|l| l.trim().to_string()).filter(|l| !l.is_empty());
        let new_region = match trimmed_loc {
            Some(l) => Some(l.to_lowercase()),
            None if ip_changed => None,
            None => prev.region.clone(),
        };
        let region_changed = prev.region != new_region;

        if ip_changed || region_changed {
            self.egress.store(Arc::new(EgressState {
                ip: Some(ip),
                region: new_region,
            }));
        }
        EgressUpdateOutcome {
            notify: ip_changed || region_changed,
        }
    }

    // -- latency -----------------------------------------------------------

    pub fn last_latency_probe_attempt_ns(&self) -> i64 {
        self.last_latency_probe_attempt_ns.load(Ordering::Acquire)
    }

    pub fn last_authority_latency_probe_attempt_ns(&self) -> i64 {
        self.last_authority_latency_probe_attempt_ns.load(Ordering::Acquire)
    }

    pub fn stamp_latency_attempt(&self, now_ns: i64, is_authority: bool) {
        self.last_latency_probe_attempt_ns.store(now_ns, Ordering::Release);
        if is_authority {
            self.last_authority_latency_probe_attempt_ns.store(now_ns, Ordering::Release);
        }
    }

    // -- outbound ----------------------------------------------------------

    pub fn has_outbound(&self) -> bool {
        self.outbound.load().is_some()
    }

    pub fn outbound(&self) -> Option<Arc<dyn Outbound>> {
        self.outbound.load_full()
    }

    pub fn set_outbound(&self, outbound: Option<Arc<dyn Outbound>>) {
        self.outbound.store(outbound);
    }

    /// Snapshot used for the `onNodeRemoved` callback payload.
    pub fn snapshot(&self) -> NodeEntrySnapshot {
        NodeEntrySnapshot {
            hash: self.hash,
            raw_options: self.raw_options.clone(),
            created_at_ns: self.created_at_ns,
            referencing_subs: self.referencing_subs(),
            egress: (*self.egress()).clone(),
            failure_count: self.failure_count(),
            circuit_open_since_ns: self.circuit_open_since_ns(),
        }
    }
}

/// A point-in-time copy of a node entry, handed to `onNodeRemoved`.
#[derive(Clone)]
pub struct NodeEntrySnapshot {
    pub hash: NodeHash,
    pub raw_options: Vec<u8>,
    pub created_at_ns: i64,
    pub referencing_subs: Vec<String>,
    pub egress: EgressState,
    pub failure_count: u32,
    pub circuit_open_since_ns: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> NodeEntry {
        NodeEntry::new(NodeHash::from_raw_options(b"{}"), vec![], 0, 8)
    }

    #[test]
    fn add_ref_is_idempotent() {
        let e = entry();
        assert!(e.add_ref("sub-1"));
        assert!(!e.add_ref("sub-1"));
        assert_eq!(e.ref_count(), 1);
    }

    #[test]
    fn remove_ref_on_absent_is_noop() {
        let e = entry();
        assert!(!e.remove_ref("sub-1"));
    }

    #[test]
    fn failure_then_success_resets() {
        let e = entry();
        for _ in 0..3 {
            let outcome = e.record_result(false, 1, 3);
            assert!(outcome.dynamic_changed);
        }
        assert!(e.is_circuit_open());
        let outcome = e.record_result(true, 2, 3);
        assert!(outcome.circuit_changed);
        assert_eq!(e.failure_count(), 0);
        assert!(!e.is_circuit_open());
    }

    #[test]
    fn circuit_opens_exactly_at_threshold() {
        let e = entry();
        assert!(!e.record_result(false, 1, 2).circuit_changed);
        assert!(e.record_result(false, 2, 2).circuit_changed);
        // already open: further failures don't re-notify
        assert!(!e.record_result(false, 3, 2).circuit_changed);
    }

    #[test]
    fn egress_loc_present_sets_region() {
        let e = entry();
        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        let outcome = e.update_egress_ip(Some(ip), Some(" US ".to_string()), 1);
        assert!(outcome.notify);
        assert_eq!(e.egress().region.as_deref(), Some("us"));
    }

    #[test]
    fn egress_nil_loc_clears_region_on_ip_change() {
        let e = entry();
        let ip1: IpAddr = "203.0.113.1".parse().unwrap();
        let ip2: IpAddr = "203.0.113.2".parse().unwrap();
        e.update_egress_ip(Some(ip1), Some("us".to_string()), 1);
        let outcome = e.update_egress_ip(Some(ip2), None, 2);
        assert!(outcome.notify);
        assert_eq!(e.egress().region, None);
    }

    #[test]
    fn egress_nil_loc_keeps_region_when_ip_unchanged() {
        let e = entry();
        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        e.update_egress_ip(Some(ip), Some("us".to_string()), 1);
        let outcome = e.update_egress_ip(Some(ip), None, 2);
        assert!(!outcome.notify);
        assert_eq!(e.egress().region.as_deref(), Some("us"));
    }

    #[test]
    fn egress_attempt_only_on_nil_ip() {
        let e = entry();
        let outcome = e.update_egress_ip(None, None, 5);
        assert!(!outcome.notify);
        assert_eq!(e.last_egress_update_attempt_ns(), 5);
        assert_eq!(e.last_egress_update_ns(), 0);
    }
}
