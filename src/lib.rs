//! Proxy-fleet control plane core: a content-addressed node pool shared
//! across subscriptions, per-platform routable views rebuilt from a shared
//! filter predicate, background probing, and sticky-lease request routing.
//!
//! The crate has no network-facing surface of its own beyond outbound HTTP
//! fetches for subscriptions and probes; everything else (proxy protocol
//! implementations, wire-format parsers, persistence) is injected through
//! the trait seams defined alongside each module.

pub mod config;
pub mod domain;
pub mod download;
pub mod ephemeral;
pub mod error;
pub mod hash;
pub mod jitter;
pub mod latency;
pub mod lease;
pub mod node;
pub mod platform;
pub mod pool;
pub mod probe;
pub mod router;
pub mod subscription;
pub mod view;

pub use config::AppConfig;
pub use domain::{DomainNormalizer, GeoResolver, NullGeoResolver, SuffixListNormalizer};
pub use download::{ConnLifecycle, DirectDownloader, NodePicker, RetryDownloader};
pub use ephemeral::EphemeralCleaner;
pub use error::{DownloadError, LeaseUpsertError, PlatformRegistrationError, RouterError};
pub use hash::{NodeHash, ParseHashError};
pub use lease::{IpLoadStats, Lease, LeaseEvent, LeaseEvents, NullLeaseEvents};
pub use node::{AsyncDuplex, BoxedDuplex, Network, NodeEntry, Outbound};
pub use platform::{AllocationPolicy, EmptyAccountBehavior, Platform, PlatformConfig, ReverseProxyMissAction, SubscriptionLookup};
pub use pool::{NullPoolEvents, Pool, PoolBuilder, PoolEvents};
pub use probe::{ProbeManager, ProberConfig};
pub use router::{LeaseCleaner, RestoredLease, RouteOutcome, Router, RouterConfig};
pub use subscription::{Subscription, SubscriptionConfig, SubscriptionManager};
pub use view::RoutableView;
