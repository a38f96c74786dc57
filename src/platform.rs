//! Platform filter predicate + routable view + dirty/rebuild protocol
//! (spec §3 `P`, §4.2, C4).

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;

use crate::domain::GeoResolver;
use crate::hash::NodeHash;
use crate::node::NodeEntry;
use crate::view::RoutableView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPolicy {
    Balanced,
    PreferLowLatency,
    PreferIdleIp,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        AllocationPolicy::Balanced
    }
}

impl AllocationPolicy {
    /// Unknown config values fall back to BALANCED (spec §6).
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "PREFER_LOW_LATENCY" => AllocationPolicy::PreferLowLatency,
            "PREFER_IDLE_IP" => AllocationPolicy::PreferIdleIp,
            "BALANCED" => AllocationPolicy::Balanced,
            _ => AllocationPolicy::Balanced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseProxyMissAction {
    TreatAsEmpty,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyAccountBehavior {
    Random,
    FixedHeader,
    AccountHeaderRule,
}

impl EmptyAccountBehavior {
    /// Invalid config values fall back to RANDOM (spec §6).
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "FIXED_HEADER" => EmptyAccountBehavior::FixedHeader,
            "ACCOUNT_HEADER_RULE" => EmptyAccountBehavior::AccountHeaderRule,
            "RANDOM" => EmptyAccountBehavior::Random,
            _ => EmptyAccountBehavior::Random,
        }
    }
}

/// Looks up the (subscription name, enabled flag, tags) a given subscription
/// id assigns to a given node hash. Injected so the platform filter doesn't
/// reach into a global registry directly (spec §4.2 tag matching).
pub trait SubscriptionLookup: Send + Sync {
    fn lookup(&self, sub_id: &str, hash: &NodeHash) -> Option<SubscriptionTagInfo>;
}

pub struct SubscriptionTagInfo {
    pub name: String,
    pub enabled: bool,
    pub tags: Vec<String>,
}

pub struct PlatformConfig {
    pub id: String,
    pub name: String,
    pub regex_filters: Vec<Regex>,
    /// Lowercase ISO 3166-1 alpha-2 codes.
    pub region_filters: Vec<String>,
    pub sticky_ttl_ns: i64,
    pub allocation_policy: AllocationPolicy,
    pub miss_action: ReverseProxyMissAction,
    pub empty_account_behavior: EmptyAccountBehavior,
    pub fixed_account_headers: Vec<String>,
}

/// A platform's filter configuration and the routable view it maintains.
pub struct Platform {
    config: PlatformConfig,
    view: RoutableView,
    /// Serializes `full_rebuild` and `notify_dirty` so view transitions are
    /// linearizable (spec §4.2).
    rebuild_lock: Mutex<()>,
}

impl Platform {
    pub fn new(config: PlatformConfig) -> Self {
        Platform {
            config,
            view: RoutableView::new(),
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn view(&self) -> &RoutableView {
        &self.view
    }

    /// Evaluates the six-criteria filter predicate for one node.
    pub fn passes(
        &self,
        hash: &NodeHash,
        entry: &NodeEntry,
        sub_lookup: Option<&dyn SubscriptionLookup>,
        geo: &dyn GeoResolver,
    ) -> bool {
        if entry.is_circuit_open() {
            return false;
        }
        if !Self::tags_match(&self.config.regex_filters, entry, hash, sub_lookup) {
            return false;
        }
        let egress = entry.egress();
        let Some(ip) = egress.ip else {
            return false;
        };
        if !self.config.region_filters.is_empty() {
            let region = egress.region.clone().or_else(|| geo.region_for(ip));
            match region {
                Some(r) if self.config.region_filters.iter().any(|allowed| allowed == &r) => {}
                _ => return false,
            }
        }
        if entry.latency_table().is_empty() {
            return false;
        }
        if !entry.has_outbound() {
            return false;
        }
        true
    }

    fn tags_match(
        regex_filters: &[Regex],
        entry: &NodeEntry,
        hash: &NodeHash,
        sub_lookup: Option<&dyn SubscriptionLookup>,
    ) -> bool {
        let Some(lookup) = sub_lookup else {
            // regexFilters == [] and no lookup -> match everything (compatibility).
            // regexFilters != [] with no lookup has no candidates to test against,
            // so it can never match; treat the same as "no candidates available".
            return regex_filters.is_empty();
        };

        let subs = entry.referencing_subs();
        if regex_filters.is_empty() {
            return subs
                .iter()
                .filter_map(|id| lookup.lookup(id, hash))
                .any(|info| info.enabled);
        }

        let mut candidates = Vec::new();
        for sub_id in &subs {
            if let Some(info) = lookup.lookup(sub_id, hash) {
                for tag in &info.tags {
                    candidates.push(format!("{}/{}", info.name, tag));
                }
            }
        }
        candidates
            .iter()
            .any(|candidate| regex_filters.iter().all(|re| re.is_match(candidate)))
    }

    /// Recomputes membership for a single hash and applies the delta to the
    /// view (spec: `notifyDirty`).
    pub fn notify_dirty(
        &self,
        hash: NodeHash,
        entry: Option<&NodeEntry>,
        sub_lookup: Option<&dyn SubscriptionLookup>,
        geo: &dyn GeoResolver,
    ) {
        let _guard = self.rebuild_lock.lock();
        let should_be_in = entry
            .map(|e| self.passes(&hash, e, sub_lookup, geo))
            .unwrap_or(false);
        if should_be_in {
            self.view.insert(hash);
        } else {
            self.view.remove(&hash);
        }
    }

    /// Recomputes the whole view against a full snapshot of pool entries.
    /// Applies only the diff against current membership, so concurrent
    /// readers never observe a transient empty view.
    pub fn full_rebuild<'a, I>(
        &self,
        entries: I,
        sub_lookup: Option<&dyn SubscriptionLookup>,
        geo: &dyn GeoResolver,
    ) where
        I: IntoIterator<Item = (NodeHash, &'a NodeEntry)>,
    {
        let _guard = self.rebuild_lock.lock();
        let mut desired = HashSet::new();
        for (hash, entry) in entries {
            if self.passes(&hash, entry, sub_lookup, geo) {
                desired.insert(hash);
            }
        }
        let current = self.view.snapshot();
        for hash in &current {
            if !desired.contains(hash) {
                self.view.remove(hash);
            }
        }
        for hash in desired {
            self.view.insert(hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NullGeoResolver;
    use crate::hash::NodeHash;
    use crate::node::NodeEntry;
    use std::net::IpAddr;

    fn base_config(id: &str) -> PlatformConfig {
        PlatformConfig {
            id: id.to_string(),
            name: id.to_string(),
            regex_filters: vec![],
            region_filters: vec![],
            sticky_ttl_ns: 0,
            allocation_policy: AllocationPolicy::Balanced,
            miss_action: ReverseProxyMissAction::TreatAsEmpty,
            empty_account_behavior: EmptyAccountBehavior::Random,
            fixed_account_headers: vec![],
        }
    }

    struct NoopOutbound;

    #[async_trait::async_trait]
    impl crate::node::Outbound for NoopOutbound {
        async fn connect(&self, _network: crate::node::Network, _addr: &str) -> std::io::Result<crate::node::BoxedDuplex> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "noop"))
        }
    }

    fn routable_entry() -> NodeEntry {
        let e = NodeEntry::new(NodeHash::from_raw_options(b"{}"), vec![], 0, 4);
        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        e.update_egress_ip(Some(ip), None, 1);
        e.latency_table().record("example.com", std::time::Duration::from_millis(1), 1, 1);
        e.set_outbound(Some(Arc::new(NoopOutbound)));
        e
    }

    #[test]
    fn all_six_criteria_must_hold() {
        let platform = Platform::new(base_config("p1"));
        let entry = routable_entry();
        let geo = NullGeoResolver;
        assert!(platform.passes(&entry.hash(), &entry, None, &geo));

        let broken = NodeEntry::new(NodeHash::from_raw_options(b"{\"a\":1}"), vec![], 0, 4);
        broken.record_result(false, 1, 1);
        assert!(!platform.passes(&broken.hash(), &broken, None, &geo));
    }

    #[test]
    fn region_filter_allows_explicit_region() {
        let mut cfg = base_config("p1");
        cfg.region_filters = vec!["us".to_string()];
        let platform = Platform::new(cfg);
        let entry = routable_entry();
        entry.update_egress_ip(Some("203.0.113.1".parse().unwrap()), Some("US".to_string()), 2);
        let geo = NullGeoResolver;
        assert!(platform.passes(&entry.hash(), &entry, None, &geo));
    }

    #[test]
    fn notify_dirty_adds_and_removes() {
        let platform = Platform::new(base_config("p1"));
        let entry = routable_entry();
        let geo = NullGeoResolver;
        platform.notify_dirty(entry.hash(), Some(&entry), None, &geo);
        assert!(platform.view().contains(&entry.hash()));
        platform.notify_dirty(entry.hash(), None, None, &geo);
        assert!(!platform.view().contains(&entry.hash()));
    }

    #[test]
    fn regex_filter_requires_candidate_matching_all() {
        struct FakeLookup;
        impl SubscriptionLookup for FakeLookup {
            fn lookup(&self, sub_id: &str, _hash: &NodeHash) -> Option<SubscriptionTagInfo> {
                Some(SubscriptionTagInfo {
                    name: sub_id.to_string(),
                    enabled: true,
                    tags: vec!["premium".to_string(), "us".to_string()],
                })
            }
        }
        let mut cfg = base_config("p1");
        cfg.regex_filters = vec![Regex::new("premium$").unwrap()];
        let platform = Platform::new(cfg);
        let entry = routable_entry();
        entry.add_ref("sub-a");
        let geo = NullGeoResolver;
        let lookup = FakeLookup;
        assert!(platform.passes(&entry.hash(), &entry, Some(&lookup), &geo));

        let mut cfg2 = base_config("p2");
        cfg2.regex_filters = vec![Regex::new("premium$").unwrap(), Regex::new("^enterprise/").unwrap()];
        let platform2 = Platform::new(cfg2);
        assert!(!platform2.passes(&entry.hash(), &entry, Some(&lookup), &geo));
    }
}
