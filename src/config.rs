//! Serde-derived configuration structs for every tunable named in spec §6,
//! with `Default` impls matching the stated defaults. Everything here is a
//! plain value; callers wrap fields in their own hot-reload cell (e.g. an
//! `ArcSwap<AppConfig>`) and hand closures reading through it to the
//! constructors that expect a `ConfigFn<T>`.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

/// Shared by every background scan loop (prober, subscription scheduler,
/// lease cleaner, ephemeral cleaner): `minIntervalSecs + U[0, jitterRangeSecs)`
/// between passes (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanLoopConfig {
    pub min_interval_secs: u64,
    pub jitter_range_secs: u64,
    pub lookahead_secs: u64,
}

impl Default for ScanLoopConfig {
    fn default() -> Self {
        ScanLoopConfig {
            min_interval_secs: 13,
            jitter_range_secs: 4,
            lookahead_secs: 15,
        }
    }
}

impl ScanLoopConfig {
    pub fn min_interval(&self) -> Duration {
        secs(self.min_interval_secs)
    }

    pub fn jitter_range(&self) -> Duration {
        secs(self.jitter_range_secs)
    }

    pub fn lookahead(&self) -> Duration {
        secs(self.lookahead_secs)
    }
}

/// Probe manager tunables (spec §6, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    #[serde(flatten)]
    pub scan: ScanLoopConfig,
    pub concurrency: usize,
    pub egress_interval_secs: u64,
    pub latency_interval_secs: u64,
    pub authority_latency_interval_secs: u64,
    pub latency_test_url: String,
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            scan: ScanLoopConfig::default(),
            concurrency: 8,
            egress_interval_secs: 24 * 3600,
            latency_interval_secs: 5 * 60,
            authority_latency_interval_secs: 3600,
            latency_test_url: "https://www.gstatic.com/generate_204".to_string(),
            user_agent: "Resin/1.0".to_string(),
        }
    }
}

impl ProbeConfig {
    pub fn egress_interval(&self) -> Duration {
        secs(self.egress_interval_secs)
    }

    pub fn latency_interval(&self) -> Duration {
        secs(self.latency_interval_secs)
    }

    pub fn authority_latency_interval(&self) -> Duration {
        secs(self.authority_latency_interval_secs)
    }
}

/// Router tunables (spec §6, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub default_platform_id: String,
    pub p2c_window_secs: u64,
    pub sticky_ttl_default_secs: u64,
    #[serde(flatten)]
    pub lease_cleaner: ScanLoopConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            default_platform_id: "default".to_string(),
            p2c_window_secs: 5 * 60,
            sticky_ttl_default_secs: 24 * 3600,
            lease_cleaner: ScanLoopConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn p2c_window(&self) -> Duration {
        secs(self.p2c_window_secs)
    }

    pub fn sticky_ttl_default(&self) -> Duration {
        secs(self.sticky_ttl_default_secs)
    }
}

/// Pool tunables (spec §6, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub failure_threshold: u32,
    pub latency_capacity: usize,
    pub latency_decay_window_secs: u64,
    pub authority_domains: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            failure_threshold: 5,
            latency_capacity: 32,
            latency_decay_window_secs: 300,
            authority_domains: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn latency_decay_window(&self) -> Duration {
        secs(self.latency_decay_window_secs)
    }

    pub fn latency_decay_window_ns(&self) -> i64 {
        self.latency_decay_window().as_nanos() as i64
    }
}

/// Subscription refresh scheduler tunables (spec §6, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    #[serde(flatten)]
    pub scan: ScanLoopConfig,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        SubscriptionConfig { scan: ScanLoopConfig::default() }
    }
}

/// Ephemeral cleaner tunables (spec §6, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralConfig {
    #[serde(flatten)]
    pub scan: ScanLoopConfig,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        EphemeralConfig { scan: ScanLoopConfig::default() }
    }
}

/// Root configuration document, aggregating every section above. Unknown
/// top-level keys are ignored so new fields can be rolled out without
/// breaking old config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub probe: ProbeConfig,
    pub router: RouterConfig,
    pub subscription: SubscriptionConfig,
    pub ephemeral: EphemeralConfig,
}

/// Parses a config document as JSON or YAML, sniffed from its first
/// non-whitespace character (spec §6: "accepts either JSON or YAML on
/// ingest").
pub fn from_str(txt: &str) -> io::Result<AppConfig> {
    let trimmed = txt.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    } else {
        serde_yaml::from_str(trimmed).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
