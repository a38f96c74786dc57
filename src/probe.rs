//! Probe manager (spec §4.3, C7): jittered egress/latency scans plus
//! immediate triggers, concurrency-bounded by a single semaphore.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::download;
use crate::hash::NodeHash;
use crate::jitter::scan_loop;
use crate::node::Outbound;
use crate::pool::Pool;

pub type ConfigFn<T> = Box<dyn Fn() -> T + Send + Sync>;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(13);
pub const DEFAULT_JITTER_RANGE: Duration = Duration::from_secs(4);
pub const DEFAULT_LOOKAHEAD: Duration = Duration::from_secs(15);
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_EGRESS_INTERVAL: Duration = Duration::from_secs(24 * 3600);
pub const DEFAULT_LATENCY_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_AUTHORITY_LATENCY_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_LATENCY_TEST_URL: &str = "https://www.gstatic.com/generate_204";
pub const DEFAULT_USER_AGENT: &str = "Resin/1.0";
pub const EGRESS_TRACE_URL: &str = "https://cloudflare.com/cdn-cgi/trace";

pub struct ProberConfig {
    pub min_interval: ConfigFn<Duration>,
    pub jitter_range: ConfigFn<Duration>,
    pub lookahead: ConfigFn<Duration>,
    pub concurrency: ConfigFn<usize>,
    pub egress_interval: ConfigFn<Duration>,
    pub latency_interval: ConfigFn<Duration>,
    pub authority_latency_interval: ConfigFn<Duration>,
    pub latency_test_url: ConfigFn<String>,
    pub user_agent: ConfigFn<String>,
    /// The pool's configured authority domains. The authority-latency due
    /// check in `due_for_latency` only applies "if authorities are
    /// configured" (spec §4.3); when this is empty, the check is skipped
    /// entirely rather than comparing against a never-stamped timestamp.
    pub authority_domains: ConfigFn<Vec<String>>,
}

impl Default for ProberConfig {
    fn default() -> Self {
        ProberConfig {
            min_interval: Box::new(|| DEFAULT_MIN_INTERVAL),
            jitter_range: Box::new(|| DEFAULT_JITTER_RANGE),
            lookahead: Box::new(|| DEFAULT_LOOKAHEAD),
            concurrency: Box::new(|| DEFAULT_CONCURRENCY),
            egress_interval: Box::new(|| DEFAULT_EGRESS_INTERVAL),
            latency_interval: Box::new(|| DEFAULT_LATENCY_INTERVAL),
            authority_latency_interval: Box::new(|| DEFAULT_AUTHORITY_LATENCY_INTERVAL),
            latency_test_url: Box::new(|| DEFAULT_LATENCY_TEST_URL.to_string()),
            user_agent: Box::new(|| DEFAULT_USER_AGENT.to_string()),
            authority_domains: Box::new(Vec::new),
        }
    }
}

/// Small result carried by the synchronous probe variants.
pub struct SyncEgressResult {
    pub ip: Option<std::net::IpAddr>,
    pub region: Option<String>,
}

pub struct SyncLatencyResult {
    pub ewma_ms: Option<f64>,
}

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Drives the egress and latency probe loops over every node in `pool`.
pub struct ProbeManager {
    pool: Arc<Pool>,
    config: ProberConfig,
    semaphore: Arc<Semaphore>,
    stop: CancellationToken,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// In-flight immediate-probe tasks, joined by `stop` to drain them
    /// (a waitgroup substitute — spec §9 Design Notes).
    immediate: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ProbeManager {
    pub fn new(pool: Arc<Pool>, config: ProberConfig) -> Self {
        let concurrency = (config.concurrency)().max(1);
        ProbeManager {
            pool,
            config,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            stop: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            immediate: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Spawns the egress and latency scan loops.
    pub fn start(self: &Arc<Self>) {
        let egress = self.clone();
        let egress_handle = tokio::spawn(async move {
            let stop = egress.stop.clone();
            scan_loop(stop, (egress.config.min_interval)(), (egress.config.jitter_range)(), || {
                let egress = egress.clone();
                async move { egress.egress_pass().await }
            })
            .await;
        });

        let latency = self.clone();
        let latency_handle = tokio::spawn(async move {
            let stop = latency.stop.clone();
            scan_loop(stop, (latency.config.min_interval)(), (latency.config.jitter_range)(), || {
                let latency = latency.clone();
                async move { latency.latency_pass().await }
            })
            .await;
        });

        self.tasks.lock().extend([egress_handle, latency_handle]);
    }

    /// Signals both loops to stop and joins them, then drains all in-flight
    /// immediate probes. Callers must stop upstream event sources first:
    /// `stop` does not itself reject new `trigger_immediate_*` calls (spec
    /// §9 Design Notes).
    pub async fn stop(&self) {
        self.stop.cancel();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        let immediate: Vec<_> = self.immediate.lock().drain(..).collect();
        for handle in immediate {
            let _ = handle.await;
        }
    }

    fn due_for_egress(&self, attempt_ns: i64, now: i64) -> bool {
        let interval = (self.config.egress_interval)().as_nanos() as i64;
        let lookahead = (self.config.lookahead)().as_nanos() as i64;
        attempt_ns + interval - lookahead <= now
    }

    fn due_for_latency(&self, entry: &crate::node::NodeEntry, now: i64) -> bool {
        let attempt = entry.last_latency_probe_attempt_ns();
        let interval = (self.config.latency_interval)().as_nanos() as i64;
        let lookahead = (self.config.lookahead)().as_nanos() as i64;
        if attempt == 0 || attempt + interval - lookahead <= now {
            return true;
        }
        if (self.config.authority_domains)().is_empty() {
            return false;
        }
        let authority_attempt = entry.last_authority_latency_probe_attempt_ns();
        let authority_interval = (self.config.authority_latency_interval)().as_nanos() as i64;
        authority_attempt + authority_interval - lookahead <= now
    }

    async fn egress_pass(&self) {
        let now = now_ns();
        let entries = self.pool.snapshot_entries();
        let futures = entries.into_iter().filter_map(|(hash, entry)| {
            if !entry.has_outbound() {
                return None;
            }
            if !self.due_for_egress(entry.last_egress_update_attempt_ns(), now) {
                return None;
            }
            Some(self.probe_egress(hash))
        });
        let bound = (self.config.concurrency)().max(1);
        futures::stream::iter(futures)
            .for_each_concurrent(bound, |fut| fut)
            .await;
    }

    async fn latency_pass(&self) {
        let now = now_ns();
        let entries = self.pool.snapshot_entries();
        let futures = entries.into_iter().filter_map(|(hash, entry)| {
            if !entry.has_outbound() {
                return None;
            }
            if !self.due_for_latency(&entry, now) {
                return None;
            }
            Some(self.probe_latency(hash))
        });
        let bound = (self.config.concurrency)().max(1);
        futures::stream::iter(futures)
            .for_each_concurrent(bound, |fut| fut)
            .await;
    }

    async fn probe_egress(&self, hash: NodeHash) {
        let _permit = match self.semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let Some(entry) = self.pool.get_entry(&hash) else { return };
        let Some(outbound) = entry.outbound() else { return };
        self.run_egress_probe(hash, outbound.as_ref()).await;
    }

    async fn probe_latency(&self, hash: NodeHash) {
        let _permit = match self.semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let Some(entry) = self.pool.get_entry(&hash) else { return };
        let Some(outbound) = entry.outbound() else { return };
        let url = (self.config.latency_test_url)();
        self.run_latency_probe(hash, outbound.as_ref(), &url).await;
    }

    /// Egress probe: GETs the Cloudflare trace endpoint, parses `ip=`/`loc=`,
    /// records the result, a TLS-handshake latency sample against
    /// `cloudflare.com`, and the egress IP/region (spec §4.3).
    async fn run_egress_probe(&self, hash: NodeHash, outbound: &dyn Outbound) {
        let user_agent = (self.config.user_agent)();
        let now = now_ns();
        match download::http_get_via_outbound(outbound, EGRESS_TRACE_URL, &user_agent, None).await {
            Ok(result) => match parse_trace(&result.body) {
                Some((ip, loc)) => {
                    self.pool.record_result(hash, true, now).await;
                    if let Some(handshake) = result.tls_handshake {
                        self.pool.record_latency(hash, "cloudflare.com", Some(handshake), now).await;
                    }
                    self.pool.update_node_egress_ip(hash, Some(ip), loc, now).await;
                }
                None => {
                    debug!("egress probe for {} got a response with no parseable ip=", hash);
                    // Parse failure: attempt-only, no health-state writeback
                    // (spec §7: "mark attempt only", distinct from a failed
                    // fetch) and do not touch lastEgressUpdateNs.
                    self.pool.update_node_egress_ip(hash, None, None, now).await;
                }
            },
            Err(e) => {
                debug!("egress probe for {} failed: {}", hash, e);
                self.pool.record_result(hash, false, now).await;
                self.pool.update_node_egress_ip(hash, None, None, now).await;
            }
        }
    }

    /// Latency probe: GETs the configured test URL and records result +
    /// latency (or attempt-only on failure) against the normalized domain
    /// (spec §4.3).
    async fn run_latency_probe(&self, hash: NodeHash, outbound: &dyn Outbound, url: &str) {
        let user_agent = (self.config.user_agent)();
        let now = now_ns();
        let domain = url::Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_string())).unwrap_or_default();
        let start = std::time::Instant::now();
        match download::http_get_via_outbound(outbound, url, &user_agent, None).await {
            Ok(result) if (200..300).contains(&result.status) => {
                self.pool.record_result(hash, true, now).await;
                let latency = result.tls_handshake.unwrap_or_else(|| start.elapsed().max(Duration::from_nanos(1)));
                self.pool.record_latency(hash, &domain, Some(latency), now).await;
            }
            _ => {
                debug!("latency probe for {} against {} failed", hash, domain);
                self.pool.record_result(hash, false, now).await;
                self.pool.record_latency(hash, &domain, None, now).await;
            }
        }
    }

    /// Enqueues a probe that *waits* for a semaphore slot (never dropped).
    /// The task is accounted so `stop` can drain all in-flight immediate
    /// probes (spec §4.3).
    pub fn trigger_immediate_egress_probe(self: &Arc<Self>, hash: NodeHash) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _permit = this.semaphore.acquire().await;
            if let Some(entry) = this.pool.get_entry(&hash) {
                if let Some(outbound) = entry.outbound() {
                    this.run_egress_probe(hash, outbound.as_ref()).await;
                }
            }
        });
        self.immediate.lock().push(handle);
    }

    /// Blocking synchronous egress probe used by callers that need an
    /// immediate answer rather than fire-and-forget pool writeback.
    pub async fn probe_egress_sync(&self, outbound: &dyn Outbound) -> Result<SyncEgressResult, crate::error::DownloadError> {
        let user_agent = (self.config.user_agent)();
        let result = download::http_get_via_outbound(outbound, EGRESS_TRACE_URL, &user_agent, None).await?;
        match parse_trace(&result.body) {
            Some((ip, region)) => Ok(SyncEgressResult { ip: Some(ip), region }),
            None => Ok(SyncEgressResult { ip: None, region: None }),
        }
    }

    /// Blocking synchronous latency probe.
    pub async fn probe_latency_sync(&self, outbound: &dyn Outbound) -> Result<SyncLatencyResult, crate::error::DownloadError> {
        let url = (self.config.latency_test_url)();
        let user_agent = (self.config.user_agent)();
        let start = std::time::Instant::now();
        let result = download::http_get_via_outbound(outbound, &url, &user_agent, None).await?;
        if !(200..300).contains(&result.status) {
            return Ok(SyncLatencyResult { ewma_ms: None });
        }
        let latency = result.tls_handshake.unwrap_or_else(|| start.elapsed());
        Ok(SyncLatencyResult {
            ewma_ms: Some(latency.as_secs_f64() * 1000.0),
        })
    }
}

use futures::StreamExt;

/// Parses `cdn-cgi/trace` style `key=value` newline-separated bodies.
/// `ip=` is required and must parse as a valid address; `loc=` is optional.
fn parse_trace(body: &[u8]) -> Option<(std::net::IpAddr, Option<String>)> {
    let text = std::str::from_utf8(body).ok()?;
    let mut ip = None;
    let mut loc = None;
    for line in text.lines() {
        if let Some(v) = line.strip_prefix("ip=") {
            ip = v.trim().parse::<std::net::IpAddr>().ok();
        } else if let Some(v) = line.strip_prefix("loc=") {
            let v = v.trim();
            if !v.is_empty() {
                loc = Some(v.to_string());
            }
        }
    }
    ip.map(|ip| (ip, loc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_and_loc() {
        let body = b"fl=1\nip=203.0.113.1\nloc=US\ncolo=SFO\n";
        let (ip, loc) = parse_trace(body).unwrap();
        assert_eq!(ip.to_string(), "203.0.113.1");
        assert_eq!(loc.as_deref(), Some("US"));
    }

    #[test]
    fn missing_ip_is_none() {
        assert!(parse_trace(b"loc=US\n").is_none());
    }

    #[test]
    fn invalid_ip_is_none() {
        assert!(parse_trace(b"ip=not-an-ip\n").is_none());
    }

    #[test]
    fn loc_optional() {
        let (ip, loc) = parse_trace(b"ip=203.0.113.1\n").unwrap();
        assert_eq!(ip.to_string(), "203.0.113.1");
        assert_eq!(loc, None);
    }
}
