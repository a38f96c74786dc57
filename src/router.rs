//! Per-request node selection: P2C random routing plus sticky leases with
//! same-IP rotation (spec §4.4, C9), and the lease cleaner that expires them
//! (spec §4.5).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::domain::DomainNormalizer;
use crate::error::{LeaseUpsertError, RouterError};
use crate::hash::NodeHash;
use crate::jitter::scan_loop;
use crate::lease::{IpLoadStats, Lease, LeaseEvent, LeaseEvents, NullLeaseEvents};
use crate::node::NodeEntry;
use crate::platform::{AllocationPolicy, Platform};
use crate::pool::Pool;

pub type ConfigFn<T> = Box<dyn Fn() -> T + Send + Sync>;

pub const DEFAULT_PLATFORM_ID: &str = "default";
pub const DEFAULT_STICKY_TTL: Duration = Duration::from_secs(24 * 3600);
/// Spec leaves the P2C freshness window unspecified; chosen to match the
/// prober's default per-domain latency refresh cadence (spec §6) so a
/// "recent" sample means "newer than we'd otherwise have re-probed it".
pub const DEFAULT_P2C_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_LEASE_CLEANER_MIN_INTERVAL: Duration = Duration::from_secs(13);
pub const DEFAULT_LEASE_CLEANER_JITTER_RANGE: Duration = Duration::from_secs(4);

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// One entry of a persistence-restore payload (spec §6 `restoreLeases`).
#[derive(Debug, Clone)]
pub struct RestoredLease {
    pub platform_id: String,
    pub account: String,
    pub node_hash_hex: String,
    pub egress_ip: String,
    pub expiry_ns: i64,
    pub last_accessed_ns: i64,
}

/// Result of a successful `Router::route_request` (spec §6).
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub platform_id: String,
    pub platform_name: String,
    pub node_hash: NodeHash,
    pub egress_ip: IpAddr,
    pub lease_created: bool,
}

pub struct RouterConfig {
    pub default_platform_id: String,
    pub p2c_window: ConfigFn<Duration>,
    pub authority_domains: ConfigFn<Vec<String>>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            default_platform_id: DEFAULT_PLATFORM_ID.to_string(),
            p2c_window: Box::new(|| DEFAULT_P2C_WINDOW),
            authority_domains: Box::new(Vec::new),
        }
    }
}

/// Per-request node selection and sticky-lease bookkeeping (spec §4.4, C9).
/// Owns one lease table and one `IpLoadStats` counter set per platform.
pub struct Router {
    pool: Arc<Pool>,
    domain_normalizer: Arc<dyn DomainNormalizer>,
    events: Arc<dyn LeaseEvents>,
    config: RouterConfig,
    leases: DashMap<String, Arc<DashMap<String, Lease>>>,
    ip_load: DashMap<String, Arc<IpLoadStats>>,
}

impl Router {
    pub fn new(pool: Arc<Pool>, domain_normalizer: Arc<dyn DomainNormalizer>, events: Arc<dyn LeaseEvents>, config: RouterConfig) -> Self {
        Router {
            pool,
            domain_normalizer,
            events,
            config,
            leases: DashMap::new(),
            ip_load: DashMap::new(),
        }
    }

    fn platform_leases(&self, platform_id: &str) -> Arc<DashMap<String, Lease>> {
        self.leases.entry(platform_id.to_string()).or_insert_with(|| Arc::new(DashMap::new())).clone()
    }

    fn ip_stats(&self, platform_id: &str) -> Arc<IpLoadStats> {
        self.ip_load.entry(platform_id.to_string()).or_insert_with(|| Arc::new(IpLoadStats::default())).clone()
    }

    fn resolve_platform(&self, platform_name: &str) -> Option<Arc<Platform>> {
        if platform_name.is_empty() {
            self.pool.get_platform(&self.config.default_platform_id)
        } else {
            self.pool.get_platform_by_name(platform_name)
        }
    }

    /// `routeRequest` (spec §4.4, §6).
    pub fn route_request(&self, platform_name: &str, account: &str, target: &str) -> Result<RouteOutcome, RouterError> {
        let platform = self.resolve_platform(platform_name).ok_or(RouterError::PlatformNotFound)?;
        let target_domain = self.domain_normalizer.normalize(target);
        if account.is_empty() {
            self.route_random(&platform, &target_domain)
        } else {
            self.route_account(&platform, account, &target_domain, now_ns())
        }
    }

    /// Accountless path: P2C pick, with one retry if the view's pick has
    /// already been dropped from the pool (spec §4.4).
    fn route_random(&self, platform: &Platform, target_domain: &str) -> Result<RouteOutcome, RouterError> {
        for _ in 0..2 {
            let Some(hash) = self.random_route(platform, target_domain) else {
                return Err(RouterError::NoAvailableNodes);
            };
            if let Some(entry) = self.pool.get_entry(&hash) {
                let Some(ip) = entry.egress().ip else { continue };
                return Ok(RouteOutcome {
                    platform_id: platform.id().to_string(),
                    platform_name: platform.name().to_string(),
                    node_hash: hash,
                    egress_ip: ip,
                    lease_created: false,
                });
            }
        }
        Err(RouterError::NoAvailableNodes)
    }

    /// Per-account sticky-lease compute (spec §4.4 steps a-d).
    fn route_account(&self, platform: &Platform, account: &str, target_domain: &str, now: i64) -> Result<RouteOutcome, RouterError> {
        let leases = self.platform_leases(platform.id());
        let ip_stats = self.ip_stats(platform.id());

        match leases.entry(account.to_string()) {
            Entry::Occupied(mut occ) => {
                let existing = occ.get().clone();

                // (a)/(b) only apply to a still-unexpired lease; an expired
                // one always falls straight through to (c) so it gets a
                // fresh expiry rather than being silently kept alive by a
                // same-IP rotation.
                if !existing.is_expired(now) {
                    // (a) still routable at the same egress IP -> touch.
                    if platform.view().contains(&existing.node_hash) {
                        if let Some(entry) = self.pool.get_entry(&existing.node_hash) {
                            if entry.egress().ip == Some(existing.egress_ip) {
                                let mut touched = existing.clone();
                                touched.last_accessed_ns = now;
                                occ.insert(touched.clone());
                                self.events.on_lease_event(LeaseEvent::Touch {
                                    platform_id: platform.id().to_string(),
                                    account: account.to_string(),
                                    node_hash: touched.node_hash,
                                    egress_ip: touched.egress_ip,
                                });
                                return Ok(self.outcome(platform, &touched, false));
                            }
                        }
                    }

                    // (b) node no longer routable at that IP: look for a same-IP replacement.
                    if let Some(replacement) = self.find_same_ip_candidate(platform, existing.egress_ip, target_domain) {
                        let mut rotated = existing.clone();
                        rotated.node_hash = replacement;
                        occ.insert(rotated.clone());
                        self.events.on_lease_event(LeaseEvent::Replace {
                            platform_id: platform.id().to_string(),
                            account: account.to_string(),
                            node_hash: rotated.node_hash,
                            egress_ip: rotated.egress_ip,
                        });
                        return Ok(self.outcome(platform, &rotated, false));
                    }
                }

                // (c) otherwise create a fresh lease.
                match self.random_route(platform, target_domain).and_then(|h| self.pool.get_entry(&h).map(|e| (h, e))) {
                    Some((hash, entry)) => {
                        let Some(ip) = entry.egress().ip else {
                            occ.remove();
                            ip_stats.decrement(existing.egress_ip);
                            self.emit_remove_or_expire(platform.id(), account, &existing, now);
                            return Err(RouterError::NoAvailableNodes);
                        };
                        let created = Lease {
                            node_hash: hash,
                            egress_ip: ip,
                            created_at_ns: now,
                            expiry_ns: now + sticky_ttl_ns(platform),
                            last_accessed_ns: now,
                        };
                        occ.insert(created.clone());
                        ip_stats.decrement(existing.egress_ip);
                        self.emit_remove_or_expire(platform.id(), account, &existing, now);
                        ip_stats.increment(ip);
                        self.events.on_lease_event(LeaseEvent::Create {
                            platform_id: platform.id().to_string(),
                            account: account.to_string(),
                            node_hash: created.node_hash,
                            egress_ip: created.egress_ip,
                        });
                        Ok(self.outcome(platform, &created, true))
                    }
                    // (d) creation failed: drop the stale lease and surface the error.
                    None => {
                        occ.remove();
                        ip_stats.decrement(existing.egress_ip);
                        self.emit_remove_or_expire(platform.id(), account, &existing, now);
                        Err(RouterError::NoAvailableNodes)
                    }
                }
            }
            Entry::Vacant(vac) => match self.random_route(platform, target_domain).and_then(|h| self.pool.get_entry(&h).map(|e| (h, e))) {
                Some((hash, entry)) => {
                    let Some(ip) = entry.egress().ip else {
                        return Err(RouterError::NoAvailableNodes);
                    };
                    let created = Lease {
                        node_hash: hash,
                        egress_ip: ip,
                        created_at_ns: now,
                        expiry_ns: now + sticky_ttl_ns(platform),
                        last_accessed_ns: now,
                    };
                    vac.insert(created.clone());
                    ip_stats.increment(ip);
                    self.events.on_lease_event(LeaseEvent::Create {
                        platform_id: platform.id().to_string(),
                        account: account.to_string(),
                        node_hash: created.node_hash,
                        egress_ip: created.egress_ip,
                    });
                    Ok(self.outcome(platform, &created, true))
                }
                None => Err(RouterError::NoAvailableNodes),
            },
        }
    }

    fn emit_remove_or_expire(&self, platform_id: &str, account: &str, old: &Lease, now: i64) {
        let event = if old.is_expired(now) {
            LeaseEvent::Expire {
                platform_id: platform_id.to_string(),
                account: account.to_string(),
                node_hash: old.node_hash,
                egress_ip: old.egress_ip,
                created_at_ns: old.created_at_ns,
            }
        } else {
            LeaseEvent::Remove {
                platform_id: platform_id.to_string(),
                account: account.to_string(),
                node_hash: old.node_hash,
                egress_ip: old.egress_ip,
                created_at_ns: old.created_at_ns,
            }
        };
        self.events.on_lease_event(event);
    }

    fn outcome(&self, platform: &Platform, lease: &Lease, lease_created: bool) -> RouteOutcome {
        RouteOutcome {
            platform_id: platform.id().to_string(),
            platform_name: platform.name().to_string(),
            node_hash: lease.node_hash,
            egress_ip: lease.egress_ip,
            lease_created,
        }
    }

    /// Finds another routable node sharing `ip`, preferring (in order) a
    /// fresh `target_domain` sample, then the lowest recent authority-average
    /// latency, then any same-IP node (spec §4.4 step b).
    fn find_same_ip_candidate(&self, platform: &Platform, ip: IpAddr, target_domain: &str) -> Option<NodeHash> {
        let candidates: Vec<(NodeHash, Arc<NodeEntry>)> = platform
            .view()
            .snapshot()
            .into_iter()
            .filter_map(|h| self.pool.get_entry(&h).map(|e| (h, e)))
            .filter(|(_, e)| e.egress().ip == Some(ip))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let mut with_target: Vec<(NodeHash, i64)> = candidates
            .iter()
            .filter_map(|(h, e)| e.latency_table().get(target_domain).map(|s| (*h, s.last_updated_ns)))
            .collect();
        if !with_target.is_empty() {
            with_target.sort_by_key(|(_, ts)| *ts);
            return with_target.last().map(|(h, _)| *h);
        }

        let authorities = (self.config.authority_domains)();
        if !authorities.is_empty() {
            let mut scored: Vec<(NodeHash, f64)> = Vec::new();
            for (h, e) in &candidates {
                let samples: Vec<f64> = authorities.iter().filter_map(|d| e.latency_table().get(d)).map(|s| s.ewma.as_secs_f64()).collect();
                if !samples.is_empty() {
                    scored.push((*h, samples.iter().sum::<f64>() / samples.len() as f64));
                }
            }
            if !scored.is_empty() {
                scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
                return Some(scored[0].0);
            }
        }

        Some(candidates[0].0)
    }

    /// P2C selection (spec §4.4 `randomRoute`): pick two distinct hashes
    /// (best-effort), score both, return the better (ties favor the second
    /// pick).
    fn random_route(&self, platform: &Platform, target_domain: &str) -> Option<NodeHash> {
        let view = platform.view();
        let size = view.size();
        if size == 0 {
            return None;
        }
        let first = view.random_pick()?;
        if size == 1 {
            return Some(first);
        }

        let mut second = None;
        for _ in 0..3 {
            if let Some(candidate) = view.random_pick() {
                if candidate != first {
                    second = Some(candidate);
                    break;
                }
            }
        }
        let Some(second) = second else { return Some(first) };

        let entry_a = self.pool.get_entry(&first);
        let entry_b = self.pool.get_entry(&second);
        let (entry_a, entry_b) = match (entry_a, entry_b) {
            (Some(a), Some(b)) => (a, b),
            (Some(_), None) => return Some(first),
            (None, Some(_)) => return Some(second),
            (None, None) => return Some(first),
        };

        let now = now_ns();
        let window_ns = (self.config.p2c_window)().as_nanos() as i64;
        let authorities = (self.config.authority_domains)();
        let (lat_a, lat_b) = comparable_latencies(&entry_a, &entry_b, target_domain, &authorities, now, window_ns);

        let ip_stats = self.ip_stats(platform.id());
        let load_a = entry_a.egress().ip.map(|ip| ip_stats.count(ip)).unwrap_or(0);
        let load_b = entry_b.egress().ip.map(|ip| ip_stats.count(ip)).unwrap_or(0);

        let score_a = score(lat_a, load_a, platform.config().allocation_policy);
        let score_b = score(lat_b, load_b, platform.config().allocation_policy);
        if score_b <= score_a {
            Some(second)
        } else {
            Some(first)
        }
    }

    /// Persistence-restore path (spec §6 `upsertLease`): validates inputs and
    /// inserts/replaces, adjusting IP load counts. Invalid entries are the
    /// caller's problem to skip (spec's `restoreLeases` silently skips them).
    pub fn upsert_lease(
        &self,
        platform_id: &str,
        account: &str,
        node_hash_hex: &str,
        egress_ip: &str,
        expiry_ns: i64,
        last_accessed_ns: i64,
    ) -> Result<(), LeaseUpsertError> {
        if platform_id.is_empty() {
            return Err(LeaseUpsertError::InvalidPlatform);
        }
        if account.is_empty() {
            return Err(LeaseUpsertError::InvalidAccount);
        }
        let node_hash = NodeHash::parse_hex(node_hash_hex)?;
        let ip: IpAddr = egress_ip.parse().map_err(|_| LeaseUpsertError::InvalidIp(egress_ip.to_string()))?;

        let leases = self.platform_leases(platform_id);
        let ip_stats = self.ip_stats(platform_id);
        let lease = Lease {
            node_hash,
            egress_ip: ip,
            // Spec's restore payload carries no createdAtNs; lastAccessedNs is
            // the closest available timestamp (see DESIGN.md).
            created_at_ns: last_accessed_ns,
            expiry_ns,
            last_accessed_ns,
        };
        if let Some(old) = leases.insert(account.to_string(), lease) {
            ip_stats.decrement(old.egress_ip);
        }
        ip_stats.increment(ip);
        Ok(())
    }

    /// Batch persistence-restore entry point (spec §6 `restoreLeases`):
    /// invalid entries are silently skipped rather than aborting the whole
    /// restore.
    pub fn restore_leases(&self, entries: &[RestoredLease]) {
        for entry in entries {
            if let Err(e) = self.upsert_lease(
                &entry.platform_id,
                &entry.account,
                &entry.node_hash_hex,
                &entry.egress_ip,
                entry.expiry_ns,
                entry.last_accessed_ns,
            ) {
                debug!("skipping invalid restored lease for platform {} account {}: {}", entry.platform_id, entry.account, e);
            }
        }
    }

    pub fn lease(&self, platform_id: &str, account: &str) -> Option<Lease> {
        self.leases.get(platform_id)?.get(account).map(|r| r.clone())
    }

    pub fn ip_load_count(&self, platform_id: &str, ip: IpAddr) -> i64 {
        self.ip_stats(platform_id).count(ip)
    }

    fn platform_ids_with_leases(&self) -> Vec<String> {
        self.leases.iter().map(|r| r.key().clone()).collect()
    }

    fn sweep_platform(&self, platform_id: &str, now: i64) {
        let leases = self.platform_leases(platform_id);
        let ip_stats = self.ip_stats(platform_id);
        let accounts: Vec<String> = leases.iter().map(|r| r.key().clone()).collect();
        for account in accounts {
            // Re-check inside the compute so a concurrent renew (touch/replace)
            // between the snapshot and now survives (spec §4.5).
            if let Entry::Occupied(occ) = leases.entry(account.clone()) {
                if occ.get().is_expired(now) {
                    let (_, removed) = occ.remove_entry();
                    ip_stats.decrement(removed.egress_ip);
                    self.events.on_lease_event(LeaseEvent::Expire {
                        platform_id: platform_id.to_string(),
                        account,
                        node_hash: removed.node_hash,
                        egress_ip: removed.egress_ip,
                        created_at_ns: removed.created_at_ns,
                    });
                }
            }
        }
    }
}

fn sticky_ttl_ns(platform: &Platform) -> i64 {
    let configured = platform.config().sticky_ttl_ns;
    if configured <= 0 {
        DEFAULT_STICKY_TTL.as_nanos() as i64
    } else {
        configured
    }
}

/// Score for P2C comparison; lower wins (spec §4.4).
fn score(latency: Duration, lease_count: i64, policy: AllocationPolicy) -> f64 {
    let lat_ms = latency.as_secs_f64() * 1000.0;
    if lat_ms <= 0.0 {
        return lease_count as f64;
    }
    match policy {
        AllocationPolicy::PreferLowLatency => lat_ms,
        AllocationPolicy::PreferIdleIp => lease_count as f64,
        AllocationPolicy::Balanced => (lease_count as f64 + 1.0) * lat_ms,
    }
}

/// The 3-level comparable-latency rule (spec §4.4): a fresh shared
/// target-domain sample wins; failing that, the mean over authority domains
/// both nodes have fresh samples for; failing that, both are 0 (incomparable,
/// score by load only).
fn comparable_latencies(a: &NodeEntry, b: &NodeEntry, target_domain: &str, authorities: &[String], now: i64, window_ns: i64) -> (Duration, Duration) {
    let recent = |entry: &NodeEntry, domain: &str| -> Option<Duration> {
        entry.latency_table().get(domain).filter(|s| now - s.last_updated_ns <= window_ns).map(|s| s.ewma)
    };

    if let (Some(la), Some(lb)) = (recent(a, target_domain), recent(b, target_domain)) {
        return (la, lb);
    }

    let mut a_vals = Vec::new();
    let mut b_vals = Vec::new();
    for domain in authorities {
        if let (Some(la), Some(lb)) = (recent(a, domain), recent(b, domain)) {
            a_vals.push(la.as_secs_f64());
            b_vals.push(lb.as_secs_f64());
        }
    }
    if !a_vals.is_empty() {
        let mean_a = a_vals.iter().sum::<f64>() / a_vals.len() as f64;
        let mean_b = b_vals.iter().sum::<f64>() / b_vals.len() as f64;
        return (Duration::from_secs_f64(mean_a), Duration::from_secs_f64(mean_b));
    }

    (Duration::ZERO, Duration::ZERO)
}

/// Jittered loop that expires stale leases across every platform with a
/// lease table, bounded by the host's logical processor count (spec §4.5).
pub struct LeaseCleaner {
    router: Arc<Router>,
    min_interval: ConfigFn<Duration>,
    jitter_range: ConfigFn<Duration>,
    stop: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LeaseCleaner {
    pub fn new(router: Arc<Router>) -> Self {
        LeaseCleaner {
            router,
            min_interval: Box::new(|| DEFAULT_LEASE_CLEANER_MIN_INTERVAL),
            jitter_range: Box::new(|| DEFAULT_LEASE_CLEANER_JITTER_RANGE),
            stop: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let stop = this.stop.clone();
            scan_loop(stop, (this.min_interval)(), (this.jitter_range)(), || {
                let this = this.clone();
                async move { this.sweep().await }
            })
            .await;
        });
        *self.task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn sweep(&self) {
        let now = now_ns();
        let platform_ids = self.router.platform_ids_with_leases();
        let bound = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        futures::stream::iter(platform_ids)
            .for_each_concurrent(bound, |pid| {
                let router = &self.router;
                async move { router.sweep_platform(&pid, now) }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{EmptyAccountBehavior, PlatformConfig, ReverseProxyMissAction};
    use std::time::Duration as StdDuration;

    struct NoopOutbound;
    #[async_trait::async_trait]
    impl crate::node::Outbound for NoopOutbound {
        async fn connect(&self, _n: crate::node::Network, _a: &str) -> std::io::Result<crate::node::BoxedDuplex> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "unused"))
        }
    }

    fn platform_config(id: &str, policy: AllocationPolicy) -> PlatformConfig {
        PlatformConfig {
            id: id.to_string(),
            name: id.to_string(),
            regex_filters: vec![],
            region_filters: vec![],
            sticky_ttl_ns: StdDuration::from_secs(3600).as_nanos() as i64,
            allocation_policy: policy,
            miss_action: ReverseProxyMissAction::TreatAsEmpty,
            empty_account_behavior: EmptyAccountBehavior::Random,
            fixed_account_headers: vec![],
        }
    }

    async fn routable_node(pool: &Pool, sub_id: &str, tag: &str, ip: &str, now: i64) -> NodeHash {
        let raw = format!(r#"{{"type":"e2e-test","tag":"{tag}"}}"#).into_bytes();
        let hash = NodeHash::from_raw_options(&raw);
        pool.add_node_from_sub(hash, &raw, sub_id, now).await;
        let entry = pool.get_entry(&hash).unwrap();
        entry.set_outbound(Some(Arc::new(NoopOutbound)));
        entry.latency_table().record("warmup.example", Duration::from_millis(1), now, 0);
        pool.update_node_egress_ip(hash, Some(ip.parse().unwrap()), None, now).await;
        hash
    }

    fn router_for(pool: Arc<Pool>) -> Router {
        Router::new(pool, Arc::new(crate::domain::SuffixListNormalizer), Arc::new(NullLeaseEvents), RouterConfig::default())
    }

    fn pool_with_failure_threshold_one() -> Arc<Pool> {
        Arc::new(Pool::builder().failure_threshold(Box::new(|| 1)).build())
    }

    #[tokio::test]
    async fn missing_platform_is_an_error() {
        let pool = Arc::new(Pool::builder().build());
        let router = router_for(pool);
        let err = router.route_request("nope", "", "example.com").unwrap_err();
        assert_eq!(err, RouterError::PlatformNotFound);
    }

    #[tokio::test]
    async fn empty_view_is_no_available_nodes() {
        let pool = Arc::new(Pool::builder().build());
        let platform = Arc::new(Platform::new(platform_config("p1", AllocationPolicy::Balanced)));
        pool.register_platform(platform).unwrap();
        let router = router_for(pool);
        let err = router.route_request("p1", "", "example.com").unwrap_err();
        assert_eq!(err, RouterError::NoAvailableNodes);
    }

    #[tokio::test]
    async fn accountless_route_picks_a_routable_node() {
        let pool = Arc::new(Pool::builder().build());
        let platform = Arc::new(Platform::new(platform_config("p1", AllocationPolicy::Balanced)));
        pool.register_platform(platform.clone()).unwrap();
        let h1 = routable_node(&pool, "sub-1", "a", "203.0.113.1", 1).await;
        let router = router_for(pool);
        let outcome = router.route_request("p1", "", "example.com").unwrap();
        assert_eq!(outcome.node_hash, h1);
        assert!(!outcome.lease_created);
    }

    #[tokio::test]
    async fn new_account_creates_a_lease() {
        let pool = Arc::new(Pool::builder().build());
        let platform = Arc::new(Platform::new(platform_config("p1", AllocationPolicy::Balanced)));
        pool.register_platform(platform.clone()).unwrap();
        routable_node(&pool, "sub-1", "a", "203.0.113.1", 1).await;
        let router = router_for(pool);
        let outcome = router.route_request("p1", "acct-1", "example.com").unwrap();
        assert!(outcome.lease_created);
        let lease = router.lease("p1", "acct-1").unwrap();
        assert_eq!(lease.node_hash, outcome.node_hash);
        assert_eq!(router.ip_load_count("p1", outcome.egress_ip), 1);
    }

    #[tokio::test]
    async fn repeat_route_touches_existing_lease() {
        let pool = Arc::new(Pool::builder().build());
        let platform = Arc::new(Platform::new(platform_config("p1", AllocationPolicy::Balanced)));
        pool.register_platform(platform.clone()).unwrap();
        routable_node(&pool, "sub-1", "a", "203.0.113.1", 1).await;
        let router = router_for(pool);
        let first = router.route_request("p1", "acct-1", "example.com").unwrap();
        let second = router.route_request("p1", "acct-1", "example.com").unwrap();
        assert_eq!(first.node_hash, second.node_hash);
        assert!(!second.lease_created);
        assert_eq!(router.ip_load_count("p1", first.egress_ip), 1);
    }

    /// Spec §8 scenario 2: sticky same-IP rotation with target-domain
    /// preference. Three nodes share an egress IP; the leased node breaks,
    /// and the replacement must be the one with a fresh sample for the
    /// requested target domain, not a random pick.
    #[tokio::test]
    async fn sticky_rotation_prefers_fresh_target_domain_sample() {
        let pool = pool_with_failure_threshold_one();
        let platform_cfg = platform_config("plat-1", AllocationPolicy::Balanced);
        let platform = Arc::new(Platform::new(platform_cfg));
        pool.register_platform(platform.clone()).unwrap();

        let a = routable_node(&pool, "sub-1", "a", "198.51.100.77", 1).await;
        let b = routable_node(&pool, "sub-1", "b", "198.51.100.77", 1).await;
        let c = routable_node(&pool, "sub-1", "c", "198.51.100.77", 1).await;

        pool.get_entry(&b).unwrap().latency_table().record("example.com", Duration::from_millis(20), 2, 0);

        let router = router_for(pool.clone());
        router.upsert_lease("plat-1", "acct-rotation", &a.to_hex(), "198.51.100.77", now_ns() + 3600_000_000_000, 1).unwrap();

        // Break node A so it's no longer routable; a single failure is enough
        // to open the circuit given the threshold configured above.
        pool.record_result(a, false, 2).await;
        assert!(!platform.view().contains(&a));

        let outcome = router.route_request("plat-1", "acct-rotation", "example.com").unwrap();
        assert_eq!(outcome.node_hash, b, "must prefer the candidate with a fresh target-domain sample");
        assert_ne!(outcome.node_hash, c);
        let lease = router.lease("plat-1", "acct-rotation").unwrap();
        assert_eq!(lease.node_hash, b);
    }

    #[tokio::test]
    async fn p2c_prefer_low_latency_picks_faster_node() {
        let pool = Arc::new(Pool::builder().build());
        let platform = Arc::new(Platform::new(platform_config("p1", AllocationPolicy::PreferLowLatency)));
        pool.register_platform(platform.clone()).unwrap();
        let fast = routable_node(&pool, "sub-1", "fast", "203.0.113.1", 1).await;
        let slow = routable_node(&pool, "sub-1", "slow", "203.0.113.2", 1).await;
        pool.get_entry(&fast).unwrap().latency_table().record("example.com", Duration::from_millis(5), 2, 0);
        pool.get_entry(&slow).unwrap().latency_table().record("example.com", Duration::from_millis(500), 2, 0);

        let router = router_for(pool);
        let mut fast_wins = 0;
        for _ in 0..20 {
            let outcome = router.route_request("p1", "", "example.com").unwrap();
            if outcome.node_hash == fast {
                fast_wins += 1;
            }
        }
        assert!(fast_wins > 0, "the faster node should win at least sometimes under P2C");
    }

    #[tokio::test]
    async fn upsert_lease_rejects_invalid_input() {
        let pool = Arc::new(Pool::builder().build());
        let router = router_for(pool);
        assert!(router.upsert_lease("", "acct", &"a".repeat(32), "1.2.3.4", 0, 0).is_err());
        assert!(router.upsert_lease("p1", "", &"a".repeat(32), "1.2.3.4", 0, 0).is_err());
        assert!(router.upsert_lease("p1", "acct", "not-hex", "1.2.3.4", 0, 0).is_err());
        assert!(router.upsert_lease("p1", "acct", &"a".repeat(32), "not-an-ip", 0, 0).is_err());
    }

    #[tokio::test]
    async fn restore_leases_skips_invalid_entries() {
        let pool = Arc::new(Pool::builder().build());
        let router = router_for(pool);
        router.restore_leases(&[
            RestoredLease {
                platform_id: "p1".to_string(),
                account: "acct-1".to_string(),
                node_hash_hex: "a".repeat(32),
                egress_ip: "203.0.113.1".to_string(),
                expiry_ns: now_ns() + 3600_000_000_000,
                last_accessed_ns: now_ns(),
            },
            RestoredLease {
                platform_id: "p1".to_string(),
                account: "acct-2".to_string(),
                node_hash_hex: "not-hex".to_string(),
                egress_ip: "203.0.113.2".to_string(),
                expiry_ns: now_ns() + 3600_000_000_000,
                last_accessed_ns: now_ns(),
            },
        ]);
        assert!(router.lease("p1", "acct-1").is_some());
        assert!(router.lease("p1", "acct-2").is_none());
    }

    /// Spec §8 scenario 6: lease expiry via cleaner.
    #[tokio::test]
    async fn cleaner_expires_lease_and_decrements_ip_load() {
        let pool = Arc::new(Pool::builder().build());
        let router = Arc::new(router_for(pool));
        let ip: IpAddr = "203.0.113.88".parse().unwrap();
        router.upsert_lease("p1", "acct-1", &"a".repeat(32), "203.0.113.88", now_ns() - 60_000_000_000, now_ns() - 120_000_000_000).unwrap();
        assert_eq!(router.ip_load_count("p1", ip), 1);

        let cleaner = LeaseCleaner::new(router.clone());
        cleaner.sweep().await;

        assert!(router.lease("p1", "acct-1").is_none());
        assert_eq!(router.ip_load_count("p1", ip), 0);
    }

    #[tokio::test]
    async fn cleaner_leaves_unexpired_leases_alone() {
        let pool = Arc::new(Pool::builder().build());
        let router = Arc::new(router_for(pool));
        router.upsert_lease("p1", "acct-1", &"a".repeat(32), "203.0.113.1", now_ns() + 3600_000_000_000, now_ns()).unwrap();
        let cleaner = LeaseCleaner::new(router.clone());
        cleaner.sweep().await;
        assert!(router.lease("p1", "acct-1").is_some());
    }
}
