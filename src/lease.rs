//! Sticky-lease data model and events (spec §3 `L`, §4.4).

use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use crate::hash::NodeHash;

#[derive(Clone, Debug)]
pub struct Lease {
    pub node_hash: NodeHash,
    pub egress_ip: IpAddr,
    pub created_at_ns: i64,
    pub expiry_ns: i64,
    pub last_accessed_ns: i64,
}

impl Lease {
    pub fn is_expired(&self, now_ns: i64) -> bool {
        self.expiry_ns < now_ns
    }
}

/// Per-(platform, account) lease events fired by the router and lease
/// cleaner. Handlers must be lightweight and non-blocking (spec §4.4).
#[derive(Clone, Debug)]
pub enum LeaseEvent {
    Create {
        platform_id: String,
        account: String,
        node_hash: NodeHash,
        egress_ip: IpAddr,
    },
    Touch {
        platform_id: String,
        account: String,
        node_hash: NodeHash,
        egress_ip: IpAddr,
    },
    Replace {
        platform_id: String,
        account: String,
        node_hash: NodeHash,
        egress_ip: IpAddr,
    },
    Remove {
        platform_id: String,
        account: String,
        node_hash: NodeHash,
        egress_ip: IpAddr,
        created_at_ns: i64,
    },
    Expire {
        platform_id: String,
        account: String,
        node_hash: NodeHash,
        egress_ip: IpAddr,
        created_at_ns: i64,
    },
}

pub trait LeaseEvents: Send + Sync {
    fn on_lease_event(&self, event: LeaseEvent);
}

#[derive(Default)]
pub struct NullLeaseEvents;
impl LeaseEvents for NullLeaseEvents {
    fn on_lease_event(&self, _event: LeaseEvent) {}
}

/// Active-lease counts per egress IP for one platform. Zero counters are
/// not eagerly removed (spec §3).
#[derive(Default)]
pub struct IpLoadStats {
    counts: DashMap<IpAddr, AtomicI64>,
}

impl IpLoadStats {
    pub fn increment(&self, ip: IpAddr) {
        self.counts.entry(ip).or_insert_with(|| AtomicI64::new(0)).fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self, ip: IpAddr) {
        if let Some(counter) = self.counts.get(&ip) {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn count(&self, ip: IpAddr) -> i64 {
        self.counts.get(&ip).map(|c| c.load(Ordering::Acquire)).unwrap_or(0)
    }
}
