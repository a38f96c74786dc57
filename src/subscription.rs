//! Subscription state and refresh scheduler (spec §3 `S`, §4.6, C6): managed
//! node map, config-version guard, parallel jittered refresh, stale-attempt
//! discard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{debug, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::download::RetryDownloader;
use crate::hash::NodeHash;
use crate::jitter::scan_loop;
use crate::pool::Pool;

pub type ConfigFn<T> = Box<dyn Fn() -> T + Send + Sync>;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(13);
pub const DEFAULT_JITTER_RANGE: Duration = Duration::from_secs(4);
pub const DEFAULT_LOOKAHEAD: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Remote,
    Local,
}

impl SourceType {
    /// Anything other than "local" normalizes to remote (spec §6).
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("local") {
            SourceType::Local
        } else {
            SourceType::Remote
        }
    }
}

/// Per-hash bookkeeping inside a subscription's managed set (spec §3
/// `managedNodes`).
#[derive(Clone, Debug, Default)]
pub struct ManagedNodeInfo {
    pub tags: Vec<String>,
    pub evicted: bool,
}

pub type ManagedNodes = HashMap<NodeHash, ManagedNodeInfo>;

/// Parses subscription content into a raw node set: hash -> (tags,
/// raw_options). The concrete wire-format parsers (sing-box JSON, Clash
/// JSON/YAML, URI lines, base64-wrapped...) are pure pipelines external to
/// this crate (spec §1); this trait is the seam they plug into.
pub trait SubscriptionParser: Send + Sync {
    fn parse(&self, content: &[u8]) -> Result<Vec<ParsedNode>, ParseError>;
}

pub struct ParsedNode {
    pub hash: NodeHash,
    pub raw_options: Vec<u8>,
    pub tag: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("subscription parse error: {0}")]
pub struct ParseError(pub String);

/// Fetches subscription content: remote over HTTP (via the retry
/// downloader), local from wherever the caller's implementation reads it
/// from (spec treats both as "fetch (remote) or read content (local)
/// *outside* the lock").
#[async_trait::async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch_remote(&self, url: &str, deadline: Option<std::time::Instant>) -> Result<Vec<u8>, crate::error::DownloadError>;
    async fn read_local(&self, content: &str) -> Result<Vec<u8>, crate::error::DownloadError>;
}

/// Default fetcher backed by a `RetryDownloader`; local content is returned
/// verbatim (the caller-supplied `content` field already holds it).
pub struct DefaultContentFetcher {
    pub downloader: Arc<RetryDownloader>,
}

#[async_trait::async_trait]
impl ContentFetcher for DefaultContentFetcher {
    async fn fetch_remote(&self, url: &str, deadline: Option<std::time::Instant>) -> Result<Vec<u8>, crate::error::DownloadError> {
        self.downloader.download(url, deadline).await
    }

    async fn read_local(&self, content: &str) -> Result<Vec<u8>, crate::error::DownloadError> {
        Ok(content.as_bytes().to_vec())
    }
}

/// Persistence/observability hook for subscription refresh (spec §6
/// `onSubUpdated`).
pub trait SubscriptionEvents: Send + Sync {
    fn on_sub_updated(&self, _sub_id: &str) {}
}

#[derive(Default)]
pub struct NullSubscriptionEvents;
impl SubscriptionEvents for NullSubscriptionEvents {}

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// A subscription's config and refresh state (spec §3 `S`).
pub struct Subscription {
    id: String,
    name: AsyncMutex<String>,
    url: AsyncMutex<String>,
    source_type: AsyncMutex<SourceType>,
    /// Inline content for local subscriptions; ignored for remote ones.
    content: AsyncMutex<String>,
    enabled: AtomicBool,
    ephemeral: bool,
    update_interval_ns: AtomicI64,
    ephemeral_evict_delay_ns: AtomicI64,
    created_at_ns: i64,
    last_checked_ns: AtomicI64,
    last_updated_ns: AtomicI64,
    last_error: AsyncMutex<Option<String>>,
    config_version: AtomicU64,
    managed_nodes: ArcSwap<ManagedNodes>,
    /// Coarse lock serializing update/rename/evict flows; held across
    /// `.await` during fetch/parse (spec §5: "opMu (coarse)").
    op_lock: AsyncMutex<()>,
}

pub struct SubscriptionConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    pub source_type: SourceType,
    pub content: String,
    pub enabled: bool,
    pub ephemeral: bool,
    pub update_interval_ns: i64,
    pub ephemeral_evict_delay_ns: i64,
    pub created_at_ns: i64,
}

impl Subscription {
    pub fn new(config: SubscriptionConfig) -> Self {
        Subscription {
            id: config.id,
            name: AsyncMutex::new(config.name),
            url: AsyncMutex::new(config.url),
            source_type: AsyncMutex::new(config.source_type),
            content: AsyncMutex::new(config.content),
            enabled: AtomicBool::new(config.enabled),
            ephemeral: config.ephemeral,
            update_interval_ns: AtomicI64::new(config.update_interval_ns),
            ephemeral_evict_delay_ns: AtomicI64::new(config.ephemeral_evict_delay_ns),
            created_at_ns: config.created_at_ns,
            last_checked_ns: AtomicI64::new(0),
            last_updated_ns: AtomicI64::new(0),
            last_error: AsyncMutex::new(None),
            config_version: AtomicU64::new(0),
            managed_nodes: ArcSwap::from_pointee(HashMap::new()),
            op_lock: AsyncMutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn ephemeral_evict_delay_ns(&self) -> i64 {
        self.ephemeral_evict_delay_ns.load(Ordering::Acquire)
    }

    pub fn update_interval_ns(&self) -> i64 {
        self.update_interval_ns.load(Ordering::Acquire)
    }

    pub fn last_checked_ns(&self) -> i64 {
        self.last_checked_ns.load(Ordering::Acquire)
    }

    pub fn last_updated_ns(&self) -> i64 {
        self.last_updated_ns.load(Ordering::Acquire)
    }

    pub fn config_version(&self) -> u64 {
        self.config_version.load(Ordering::Acquire)
    }

    pub fn managed_nodes(&self) -> Arc<ManagedNodes> {
        self.managed_nodes.load_full()
    }

    /// Marks the given hashes `evicted=true` in the managed map, keeping the
    /// hash itself (spec §4.7 step 4: "mark them evicted ... keep the hash").
    /// A later refresh inherits the flag and will not resurrect the node.
    pub fn mark_evicted(&self, hashes: &[NodeHash]) {
        let current = self.managed_nodes();
        let mut next = (*current).clone();
        for hash in hashes {
            if let Some(info) = next.get_mut(hash) {
                info.evicted = true;
            }
        }
        self.managed_nodes.store(Arc::new(next));
    }

    /// Seeds the managed map directly, bypassing fetch/parse. Test-only: lets
    /// cleaner/scheduler tests set up subscription state without a working
    /// `SubscriptionParser`/`ContentFetcher` pair.
    #[cfg(test)]
    pub fn adopt_for_test(&self, nodes: Vec<(NodeHash, Vec<u8>)>) {
        let mut next: ManagedNodes = HashMap::new();
        for (hash, _raw_options) in nodes {
            next.insert(hash, ManagedNodeInfo::default());
        }
        self.managed_nodes.store(Arc::new(next));
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.lock().await.clone()
    }

    pub async fn name(&self) -> String {
        self.name.lock().await.clone()
    }

    pub async fn url(&self) -> String {
        self.url.lock().await.clone()
    }

    /// Bumps `configVersion` whenever a field that affects refresh input
    /// changes (spec §3). Caller serializes via `op_lock`.
    pub async fn set_url(&self, url: String) {
        let _op = self.op_lock.lock().await;
        let mut current = self.url.lock().await;
        if *current != url {
            *current = url;
            self.config_version.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub async fn set_source_type(&self, source_type: SourceType) {
        let _op = self.op_lock.lock().await;
        let mut current = self.source_type.lock().await;
        if *current != source_type {
            *current = source_type;
            self.config_version.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub async fn set_content(&self, content: String) {
        let _op = self.op_lock.lock().await;
        let mut current = self.content.lock().await;
        if *current != content {
            *current = content;
            self.config_version.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub async fn set_update_interval_ns(&self, interval_ns: i64) {
        let _op = self.op_lock.lock().await;
        if self.update_interval_ns.swap(interval_ns, Ordering::AcqRel) != interval_ns {
            self.config_version.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn due(&self, now: i64, lookahead_ns: i64) -> bool {
        self.is_enabled() && self.last_checked_ns() + self.update_interval_ns() - lookahead_ns <= now
    }
}

/// Drives the subscription refresh pipeline: fetch -> parse -> diff -> swap
/// -> pool mutation (spec §4.6).
pub struct SubscriptionManager {
    pool: Arc<Pool>,
    subs: dashmap::DashMap<String, Arc<Subscription>>,
    parser: Arc<dyn SubscriptionParser>,
    fetcher: Arc<dyn ContentFetcher>,
    events: Arc<dyn SubscriptionEvents>,
    min_interval: ConfigFn<Duration>,
    jitter_range: ConfigFn<Duration>,
    lookahead: ConfigFn<Duration>,
    stop: CancellationToken,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SubscriptionManager {
    pub fn new(
        pool: Arc<Pool>,
        parser: Arc<dyn SubscriptionParser>,
        fetcher: Arc<dyn ContentFetcher>,
        events: Arc<dyn SubscriptionEvents>,
    ) -> Self {
        SubscriptionManager {
            pool,
            subs: dashmap::DashMap::new(),
            parser,
            fetcher,
            events,
            min_interval: Box::new(|| DEFAULT_MIN_INTERVAL),
            jitter_range: Box::new(|| DEFAULT_JITTER_RANGE),
            lookahead: Box::new(|| DEFAULT_LOOKAHEAD),
            stop: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn add_subscription(&self, sub: Arc<Subscription>) {
        self.subs.insert(sub.id().to_string(), sub);
    }

    pub fn get_subscription(&self, id: &str) -> Option<Arc<Subscription>> {
        self.subs.get(id).map(|r| r.value().clone())
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subs.iter().map(|r| r.value().clone()).collect()
    }

    /// Spawns the scan loop: each tick, collects due-and-enabled
    /// subscriptions and refreshes them in parallel, bounded by the host's
    /// logical processor count (spec §4.6).
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let stop = this.stop.clone();
            scan_loop(stop, (this.min_interval)(), (this.jitter_range)(), || {
                let this = this.clone();
                async move { this.tick().await }
            })
            .await;
        });
        self.tasks.lock().push(handle);
    }

    pub async fn stop(&self) {
        self.stop.cancel();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn tick(&self) {
        let now = now_ns();
        let lookahead_ns = (self.lookahead)().as_nanos() as i64;
        let due: Vec<Arc<Subscription>> = self
            .subs
            .iter()
            .map(|r| r.value().clone())
            .filter(|s| s.due(now, lookahead_ns))
            .collect();
        debug!("subscription scan tick: {} due for refresh", due.len());
        let bound = available_parallelism();
        futures::stream::iter(due)
            .for_each_concurrent(bound, |sub| {
                let this = self;
                async move { this.update_subscription(&sub).await }
            })
            .await;
    }

    /// Unconditionally refreshes every enabled subscription, regardless of
    /// due-ness (used once at startup to compensate for weak persistence,
    /// spec §4.6).
    pub async fn force_refresh_all(&self) {
        let all: Vec<Arc<Subscription>> = self.subs.iter().map(|r| r.value().clone()).filter(|s| s.is_enabled()).collect();
        let bound = available_parallelism();
        futures::stream::iter(all)
            .for_each_concurrent(bound, |sub| async move { self.update_subscription(&sub).await })
            .await;
    }

    /// Spawns `force_refresh_all` on a tracked task.
    pub fn force_refresh_all_async(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.force_refresh_all().await });
        self.tasks.lock().push(handle);
    }

    /// Serialized by the subscription's own op lock (spec §4.6
    /// `updateSubscription`). Discards the attempt if `configVersion`
    /// changed mid-flight, or if a newer attempt already committed
    /// (`lastUpdatedNs > attemptStartedNs`).
    pub async fn update_subscription(&self, sub: &Subscription) {
        let attempt_started_ns = now_ns();
        let snapshot_version = sub.config_version();
        let url = sub.url().await;
        let source_type = *sub.source_type.lock().await;
        let content = sub.content.lock().await.clone();

        let fetch_result = match source_type {
            SourceType::Remote => self.fetcher.fetch_remote(&url, None).await,
            SourceType::Local => self.fetcher.read_local(&content).await,
        };

        let _op = sub.op_lock.lock().await;

        let raw_bytes = match fetch_result {
            Ok(bytes) => bytes,
            Err(e) => {
                self.commit_failure(sub, snapshot_version, attempt_started_ns, e.to_string()).await;
                return;
            }
        };

        let parsed = match self.parser.parse(&raw_bytes) {
            Ok(nodes) => nodes,
            Err(e) => {
                self.commit_failure(sub, snapshot_version, attempt_started_ns, e.to_string()).await;
                return;
            }
        };

        if sub.config_version() != snapshot_version {
            return;
        }
        if sub.last_updated_ns() > attempt_started_ns {
            return;
        }

        let mut next_managed: ManagedNodes = HashMap::new();
        let mut raw_options_by_hash: HashMap<NodeHash, Vec<u8>> = HashMap::new();
        for node in parsed {
            raw_options_by_hash.entry(node.hash).or_insert_with(|| node.raw_options.clone());
            let info = next_managed.entry(node.hash).or_insert_with(ManagedNodeInfo::default);
            if let Some(tag) = node.tag {
                if !info.tags.contains(&tag) {
                    info.tags.push(tag);
                }
            }
        }

        let previous = sub.managed_nodes();
        for (hash, info) in next_managed.iter_mut() {
            if let Some(prev_info) = previous.get(hash) {
                if prev_info.evicted {
                    info.evicted = true;
                }
            }
        }

        let added: Vec<NodeHash> = next_managed.keys().filter(|h| !previous.contains_key(h)).copied().collect();
        let removed: Vec<NodeHash> = previous.keys().filter(|h| !next_managed.contains_key(h)).copied().collect();
        let kept: Vec<NodeHash> = next_managed.keys().filter(|h| previous.contains_key(h)).copied().collect();
        let (added_count, removed_count, kept_count) = (added.len(), removed.len(), kept.len());

        sub.managed_nodes.store(Arc::new(next_managed.clone()));

        let now = now_ns();
        for hash in added.into_iter().chain(kept) {
            let info = &next_managed[&hash];
            if info.evicted {
                continue;
            }
            let raw = raw_options_by_hash.get(&hash).cloned().unwrap_or_default();
            self.pool.add_node_from_sub(hash, &raw, sub.id(), now).await;
        }
        for hash in removed {
            self.pool.remove_node_from_sub(hash, sub.id()).await;
        }

        sub.last_checked_ns.store(now, Ordering::Release);
        sub.last_updated_ns.store(now, Ordering::Release);
        *sub.last_error.lock().await = None;
        info!("subscription {} refreshed: {} added, {} removed, {} kept", sub.id(), added_count, removed_count, kept_count);
        self.events.on_sub_updated(sub.id());
    }

    /// Failure path: stamps `lastCheckedNs`/`lastError` under the same
    /// config-version/stale guard, but leaves the previous managed set (and
    /// therefore pool membership) untouched (spec §4.6, §7).
    async fn commit_failure(&self, sub: &Subscription, snapshot_version: u64, attempt_started_ns: i64, error: String) {
        if sub.config_version() != snapshot_version {
            return;
        }
        if sub.last_updated_ns() > attempt_started_ns {
            return;
        }
        sub.last_checked_ns.store(now_ns(), Ordering::Release);
        warn!("subscription {} refresh failed: {}", sub.id(), error);
        *sub.last_error.lock().await = Some(error);
        self.events.on_sub_updated(sub.id());
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

use futures::StreamExt;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FixedParser(Vec<ParsedNode>);
    impl SubscriptionParser for FixedParser {
        fn parse(&self, _content: &[u8]) -> Result<Vec<ParsedNode>, ParseError> {
            Ok(self
                .0
                .iter()
                .map(|n| ParsedNode {
                    hash: n.hash,
                    raw_options: n.raw_options.clone(),
                    tag: n.tag.clone(),
                })
                .collect())
        }
    }

    struct FailingParser;
    impl SubscriptionParser for FailingParser {
        fn parse(&self, _content: &[u8]) -> Result<Vec<ParsedNode>, ParseError> {
            Err(ParseError("boom".to_string()))
        }
    }

    struct GatedFetcher {
        gate: Arc<tokio::sync::Notify>,
        waited: StdMutex<bool>,
        body: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl ContentFetcher for GatedFetcher {
        async fn fetch_remote(&self, _url: &str, _deadline: Option<std::time::Instant>) -> Result<Vec<u8>, crate::error::DownloadError> {
            if !*self.waited.lock().unwrap() {
                *self.waited.lock().unwrap() = true;
                self.gate.notified().await;
            }
            Ok(self.body.clone())
        }
        async fn read_local(&self, content: &str) -> Result<Vec<u8>, crate::error::DownloadError> {
            Ok(content.as_bytes().to_vec())
        }
    }

    struct ImmediateFetcher(Vec<u8>);
    #[async_trait::async_trait]
    impl ContentFetcher for ImmediateFetcher {
        async fn fetch_remote(&self, _url: &str, _deadline: Option<std::time::Instant>) -> Result<Vec<u8>, crate::error::DownloadError> {
            Ok(self.0.clone())
        }
        async fn read_local(&self, content: &str) -> Result<Vec<u8>, crate::error::DownloadError> {
            Ok(content.as_bytes().to_vec())
        }
    }

    fn sub(id: &str) -> Arc<Subscription> {
        Arc::new(Subscription::new(SubscriptionConfig {
            id: id.to_string(),
            name: id.to_string(),
            url: format!("https://example.com/{id}"),
            source_type: SourceType::Remote,
            content: String::new(),
            enabled: true,
            ephemeral: false,
            update_interval_ns: Duration::from_secs(3600).as_nanos() as i64,
            ephemeral_evict_delay_ns: 0,
            created_at_ns: 0,
        }))
    }

    fn node(tag: &str) -> ParsedNode {
        let raw = format!(r#"{{"type":"e2e-test","tag":"{tag}"}}"#).into_bytes();
        ParsedNode {
            hash: NodeHash::from_raw_options(&raw),
            raw_options: raw,
            tag: Some(tag.to_string()),
        }
    }

    #[tokio::test]
    async fn refresh_adds_nodes_to_pool() {
        let pool = Arc::new(Pool::builder().build());
        let parser = Arc::new(FixedParser(vec![node("a")]));
        let fetcher = Arc::new(ImmediateFetcher(b"irrelevant".to_vec()));
        let mgr = SubscriptionManager::new(pool.clone(), parser, fetcher, Arc::new(NullSubscriptionEvents));
        let s = sub("sub-1");
        mgr.update_subscription(&s).await;
        assert_eq!(pool.size(), 1);
        assert_eq!(s.managed_nodes().len(), 1);
    }

    #[tokio::test]
    async fn failure_keeps_previous_managed_set() {
        let pool = Arc::new(Pool::builder().build());
        let good_parser = Arc::new(FixedParser(vec![node("a")]));
        let fetcher = Arc::new(ImmediateFetcher(b"irrelevant".to_vec()));
        let mgr = SubscriptionManager::new(pool.clone(), good_parser, fetcher, Arc::new(NullSubscriptionEvents));
        let s = sub("sub-1");
        mgr.update_subscription(&s).await;
        assert_eq!(pool.size(), 1);

        let failing = Arc::new(FailingParser);
        let mgr2 = SubscriptionManager::new(pool.clone(), failing, Arc::new(ImmediateFetcher(vec![])), Arc::new(NullSubscriptionEvents));
        mgr2.update_subscription(&s).await;
        assert_eq!(pool.size(), 1, "failed refresh must not drop existing nodes");
        assert!(s.last_error().await.is_some());
    }

    #[tokio::test]
    async fn stale_attempt_is_discarded() {
        let pool = Arc::new(Pool::builder().build());
        let gate = Arc::new(tokio::sync::Notify::new());
        let slow_fetcher = Arc::new(GatedFetcher {
            gate: gate.clone(),
            waited: StdMutex::new(false),
            body: b"old".to_vec(),
        });
        let old_parser = Arc::new(FixedParser(vec![node("old")]));
        let s = sub("sub-1");

        let mgr_slow = Arc::new(SubscriptionManager::new(pool.clone(), old_parser, slow_fetcher, Arc::new(NullSubscriptionEvents)));
        let mgr_slow2 = mgr_slow.clone();
        let s2 = s.clone();
        let slow_task = tokio::spawn(async move {
            mgr_slow2.update_subscription(&s2).await;
        });

        tokio::task::yield_now().await;

        let new_parser = Arc::new(FixedParser(vec![node("new")]));
        let fast_fetcher = Arc::new(ImmediateFetcher(b"new".to_vec()));
        let mgr_fast = SubscriptionManager::new(pool.clone(), new_parser, fast_fetcher, Arc::new(NullSubscriptionEvents));
        mgr_fast.update_subscription(&s).await;
        assert_eq!(pool.size(), 1);

        gate.notify_one();
        slow_task.await.unwrap();

        assert_eq!(pool.size(), 1, "stale attempt must not resurrect the old node");
        let managed = s.managed_nodes();
        assert_eq!(managed.len(), 1);
        let new_hash = NodeHash::from_raw_options(br#"{"type":"e2e-test","tag":"new"}"#);
        assert!(managed.contains_key(&new_hash));
    }

    #[test]
    fn source_type_normalizes_unknown_to_remote() {
        assert_eq!(SourceType::parse("local"), SourceType::Local);
        assert_eq!(SourceType::parse("LOCAL"), SourceType::Local);
        assert_eq!(SourceType::parse("remote"), SourceType::Remote);
        assert_eq!(SourceType::parse("weird"), SourceType::Remote);
    }
}
