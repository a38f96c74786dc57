//! Global, content-addressed, multi-subscription reference-counted node
//! pool, with health writeback and platform fan-out (spec §4.1, C5).

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};

use crate::domain::{DomainNormalizer, GeoResolver};
use crate::hash::NodeHash;
use crate::node::{NodeEntry, NodeEntrySnapshot};
use crate::platform::{Platform, SubscriptionLookup};

/// Fire-and-forget persistence/observability hooks (spec §6). Handlers must
/// be cheap and non-blocking; default bodies are no-ops so callers implement
/// only what they need.
pub trait PoolEvents: Send + Sync {
    fn on_node_added(&self, _hash: NodeHash) {}
    fn on_node_removed(&self, _hash: NodeHash, _snapshot: NodeEntrySnapshot) {}
    fn on_sub_node_changed(&self, _sub_id: &str, _hash: NodeHash, _added: bool) {}
    fn on_node_dynamic_changed(&self, _hash: NodeHash) {}
    fn on_node_latency_changed(&self, _hash: NodeHash, _domain: &str) {}
}

/// A `PoolEvents` implementation that drops every event; useful for tests
/// and as a starting point for partial overrides.
#[derive(Default)]
pub struct NullPoolEvents;
impl PoolEvents for NullPoolEvents {}

/// A closure-backed runtime knob, pulled fresh on every call so config
/// changes apply without restarting background loops.
pub type ConfigFn<T> = Box<dyn Fn() -> T + Send + Sync>;

pub use crate::error::PlatformRegistrationError;

pub struct Pool {
    nodes: DashMap<NodeHash, Arc<NodeEntry>>,
    platforms_by_id: DashMap<String, Arc<Platform>>,
    platforms_by_name: DashMap<String, String>,
    sub_lookup: ArcSwapOption<dyn SubscriptionLookup>,
    geo: Arc<dyn GeoResolver>,
    domain_normalizer: Arc<dyn DomainNormalizer>,
    events: Arc<dyn PoolEvents>,
    failure_threshold: ConfigFn<u32>,
    latency_capacity: ConfigFn<usize>,
    latency_decay_window_ns: ConfigFn<i64>,
    authority_domains: ConfigFn<Vec<String>>,
    size: AtomicUsize,
}

pub struct PoolBuilder {
    geo: Arc<dyn GeoResolver>,
    domain_normalizer: Arc<dyn DomainNormalizer>,
    events: Arc<dyn PoolEvents>,
    failure_threshold: ConfigFn<u32>,
    latency_capacity: ConfigFn<usize>,
    latency_decay_window_ns: ConfigFn<i64>,
    authority_domains: ConfigFn<Vec<String>>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        PoolBuilder {
            geo: Arc::new(crate::domain::NullGeoResolver),
            domain_normalizer: Arc::new(crate::domain::SuffixListNormalizer),
            events: Arc::new(NullPoolEvents),
            failure_threshold: Box::new(|| 5),
            latency_capacity: Box::new(|| 32),
            latency_decay_window_ns: Box::new(|| Duration::from_secs(300).as_nanos() as i64),
            authority_domains: Box::new(|| Vec::new()),
        }
    }
}

impl PoolBuilder {
    pub fn geo(mut self, geo: Arc<dyn GeoResolver>) -> Self {
        self.geo = geo;
        self
    }

    pub fn domain_normalizer(mut self, normalizer: Arc<dyn DomainNormalizer>) -> Self {
        self.domain_normalizer = normalizer;
        self
    }

    pub fn events(mut self, events: Arc<dyn PoolEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn failure_threshold(mut self, f: ConfigFn<u32>) -> Self {
        self.failure_threshold = f;
        self
    }

    pub fn latency_capacity(mut self, f: ConfigFn<usize>) -> Self {
        self.latency_capacity = f;
        self
    }

    pub fn latency_decay_window_ns(mut self, f: ConfigFn<i64>) -> Self {
        self.latency_decay_window_ns = f;
        self
    }

    pub fn authority_domains(mut self, f: ConfigFn<Vec<String>>) -> Self {
        self.authority_domains = f;
        self
    }

    pub fn build(self) -> Pool {
        Pool {
            nodes: DashMap::new(),
            platforms_by_id: DashMap::new(),
            platforms_by_name: DashMap::new(),
            sub_lookup: ArcSwapOption::empty(),
            geo: self.geo,
            domain_normalizer: self.domain_normalizer,
            events: self.events,
            failure_threshold: self.failure_threshold,
            latency_capacity: self.latency_capacity,
            latency_decay_window_ns: self.latency_decay_window_ns,
            authority_domains: self.authority_domains,
            size: AtomicUsize::new(0),
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl Pool {
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    pub fn set_subscription_lookup(&self, lookup: Option<Arc<dyn SubscriptionLookup>>) {
        self.sub_lookup.store(lookup);
    }

    pub fn get_entry(&self, hash: &NodeHash) -> Option<Arc<NodeEntry>> {
        self.nodes.get(hash).map(|r| r.value().clone())
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn range<F: FnMut(NodeHash, &Arc<NodeEntry>)>(&self, mut f: F) {
        for entry in self.nodes.iter() {
            f(*entry.key(), entry.value());
        }
    }

    pub fn snapshot_entries(&self) -> Vec<(NodeHash, Arc<NodeEntry>)> {
        self.nodes.iter().map(|e| (*e.key(), e.value().clone())).collect()
    }

    /// Atomic load-or-create + idempotent ref add, then dirty-notify.
    pub async fn add_node_from_sub(&self, hash: NodeHash, raw_options: &[u8], sub_id: &str, now_ns: i64) {
        let (is_new, ref_added) = match self.nodes.entry(hash) {
            Entry::Occupied(o) => (false, o.get().add_ref(sub_id)),
            Entry::Vacant(v) => {
                let capacity = (self.latency_capacity)();
                let entry = Arc::new(NodeEntry::new(hash, raw_options.to_vec(), now_ns, capacity));
                entry.add_ref(sub_id);
                v.insert(entry);
                (true, true)
            }
        };
        if is_new {
            self.size.fetch_add(1, Ordering::AcqRel);
            debug!("node {} added to pool (sub {})", hash, sub_id);
            self.events.on_node_added(hash);
        }
        if ref_added {
            self.events.on_sub_node_changed(sub_id, hash, true);
        }
        self.notify_all_platforms_dirty(hash).await;
    }

    /// Atomic ref removal; deletes the entry once its reference set empties.
    /// A no-op when `(hash, sub_id)` isn't present.
    pub async fn remove_node_from_sub(&self, hash: NodeHash, sub_id: &str) {
        let mut ref_removed = false;
        let mut deleted_snapshot: Option<NodeEntrySnapshot> = None;
        if let Entry::Occupied(o) = self.nodes.entry(hash) {
            ref_removed = o.get().remove_ref(sub_id);
            if ref_removed && o.get().ref_count() == 0 {
                let (_, entry) = o.remove_entry();
                deleted_snapshot = Some(entry.snapshot());
            }
        }
        if !ref_removed {
            return;
        }
        self.events.on_sub_node_changed(sub_id, hash, false);
        if let Some(snapshot) = deleted_snapshot {
            self.size.fetch_sub(1, Ordering::AcqRel);
            debug!("node {} dropped from pool, last reference was sub {}", hash, sub_id);
            self.events.on_node_removed(hash, snapshot);
        }
        self.notify_all_platforms_dirty(hash).await;
    }

    /// Registers a brand-new platform. Its view is fully built before it
    /// becomes visible to `get_platform`/`get_platform_by_name` lookups.
    pub fn register_platform(&self, platform: Arc<Platform>) -> Result<(), PlatformRegistrationError> {
        self.replace_platform(platform)
    }

    /// Swaps in `next` for its platform id. `next`'s view is rebuilt from a
    /// full pool snapshot *before* the pointer swap is published, so no
    /// reader ever observes an empty in-transition view.
    pub fn replace_platform(&self, next: Arc<Platform>) -> Result<(), PlatformRegistrationError> {
        if let Some(existing_id) = self.platforms_by_name.get(next.name()) {
            if existing_id.value() != next.id() {
                warn!("platform registration for {} rejected: name {} already owned by {}", next.id(), next.name(), existing_id.value());
                return Err(PlatformRegistrationError::NameConflict(next.name().to_string()));
            }
        }

        let entries = self.snapshot_entries();
        let borrowed: Vec<(NodeHash, &NodeEntry)> = entries.iter().map(|(h, e)| (*h, e.as_ref())).collect();
        let sub_lookup = self.sub_lookup.load();
        next.full_rebuild(borrowed, sub_lookup.as_deref(), self.geo.as_ref());

        if let Some(old) = self.platforms_by_id.get(next.id()) {
            if old.name() != next.name() {
                self.platforms_by_name.remove(old.name());
            }
        }
        self.platforms_by_name.insert(next.name().to_string(), next.id().to_string());
        info!("platform {} ({}) registered, view size {}", next.id(), next.name(), next.view().size());
        self.platforms_by_id.insert(next.id().to_string(), next);
        Ok(())
    }

    pub fn get_platform(&self, id: &str) -> Option<Arc<Platform>> {
        self.platforms_by_id.get(id).map(|r| r.value().clone())
    }

    pub fn get_platform_by_name(&self, name: &str) -> Option<Arc<Platform>> {
        let id = self.platforms_by_name.get(name)?;
        self.get_platform(id.value())
    }

    /// Snapshots the registered platforms, then invokes each one's
    /// `notify_dirty` concurrently, bounded by the host's logical
    /// processor count (spec §4.1 dirty fan-out).
    async fn notify_all_platforms_dirty(&self, hash: NodeHash) {
        let platforms: Vec<Arc<Platform>> = self.platforms_by_id.iter().map(|r| r.value().clone()).collect();
        if platforms.is_empty() {
            return;
        }
        let entry = self.get_entry(&hash);
        let sub_lookup = self.sub_lookup.load();
        let geo = self.geo.clone();
        let bound = available_parallelism();
        stream::iter(platforms)
            .for_each_concurrent(bound, |platform| {
                let entry = entry.clone();
                let sub_lookup = sub_lookup.clone();
                let geo = geo.clone();
                async move {
                    platform.notify_dirty(hash, entry.as_deref(), sub_lookup.as_deref(), geo.as_ref());
                }
            })
            .await;
    }

    /// Applies a probe result, notifying platforms only when the circuit
    /// state actually changed (spec §4.1 `recordResult`).
    pub async fn record_result(&self, hash: NodeHash, success: bool, now_ns: i64) {
        let Some(entry) = self.get_entry(&hash) else {
            return;
        };
        let threshold = (self.failure_threshold)();
        let outcome = entry.record_result(success, now_ns, threshold);
        if outcome.dynamic_changed {
            self.events.on_node_dynamic_changed(hash);
        }
        if outcome.circuit_changed {
            if entry.is_circuit_open() {
                warn!("node {} circuit opened after {} failures", hash, threshold);
            } else {
                info!("node {} circuit closed", hash);
            }
            self.notify_all_platforms_dirty(hash).await;
        }
    }

    /// Records a latency sample against a normalized domain (spec §4.1
    /// `recordLatency`). `latency` of `None` or non-positive is attempt-only.
    pub async fn record_latency(&self, hash: NodeHash, raw_target: &str, latency: Option<Duration>, now_ns: i64) {
        let Some(entry) = self.get_entry(&hash) else {
            return;
        };
        let domain = self.domain_normalizer.normalize(raw_target);
        let authorities = (self.authority_domains)();
        let is_authority = authorities.iter().any(|d| d == &domain);
        entry.stamp_latency_attempt(now_ns, is_authority);

        let Some(latency) = latency else {
            return;
        };
        if latency.is_zero() {
            return;
        }
        let decay_window_ns = (self.latency_decay_window_ns)();
        let became_non_empty = entry.latency_table().record(&domain, latency, now_ns, decay_window_ns);
        self.events.on_node_latency_changed(hash, &domain);
        if became_non_empty {
            self.notify_all_platforms_dirty(hash).await;
        }
    }

    /// Updates egress IP/region (spec §4.1 `updateNodeEgressIP`).
    pub async fn update_node_egress_ip(&self, hash: NodeHash, ip: Option<IpAddr>, loc: Option<String>, now_ns: i64) {
        let Some(entry) = self.get_entry(&hash) else {
            return;
        };
        let outcome = entry.update_egress_ip(ip, loc, now_ns);
        if outcome.notify {
            self.notify_all_platforms_dirty(hash).await;
        }
    }
}
