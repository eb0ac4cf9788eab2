// Response cache
// TTL per data type, one in-flight fetch per key

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use super::error::GatewayError;

/// Data type a cached response belongs to; selects the TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Demographics,
    ExemptionStatus,
    Eligibility,
    Prescriptions,
}

impl DataType {
    pub const ALL: [DataType; 4] = [
        Self::Demographics,
        Self::ExemptionStatus,
        Self::Eligibility,
        Self::Prescriptions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Demographics => "demographics",
            Self::ExemptionStatus => "exemption_status",
            Self::Eligibility => "eligibility",
            Self::Prescriptions => "prescriptions",
        }
    }

    fn default_ttl(&self) -> Duration {
        match self {
            Self::Demographics => Duration::from_secs(24 * 3600),
            Self::ExemptionStatus => Duration::from_secs(12 * 3600),
            Self::Eligibility => Duration::from_secs(24 * 3600),
            Self::Prescriptions => Duration::from_secs(5 * 60),
        }
    }
}

/// TTL table keyed by data type
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    ttls: HashMap<DataType, Duration>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            ttls: DataType::ALL
                .iter()
                .map(|dt| (*dt, dt.default_ttl()))
                .collect(),
        }
    }
}

impl TtlPolicy {
    /// Defaults overlaid with `overrides` (data type name -> seconds)
    pub fn from_overrides(overrides: &HashMap<String, u64>) -> Self {
        let mut policy = Self::default();
        for (name, secs) in overrides {
            match DataType::ALL.iter().find(|dt| dt.as_str() == name) {
                Some(dt) => {
                    policy.ttls.insert(*dt, Duration::from_secs(*secs));
                }
                None => tracing::warn!("Ignoring TTL for unknown data type: {}", name),
            }
        }
        policy
    }

    pub fn ttl_for(&self, data_type: DataType) -> Duration {
        self.ttls
            .get(&data_type)
            .copied()
            .unwrap_or_else(|| data_type.default_ttl())
    }
}

/// Memoized downstream response
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub inserted_at: Instant,
    pub ttl: Duration,
    pub data_type: DataType,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, GatewayError>>>;

enum Slot {
    Ready(CacheEntry),
    Pending(SharedFetch),
}

/// Held by the caller that started a fetch. If that caller is dropped before
/// the fetch settles (deadline, disconnect), its pending slot is removed so
/// later lookups start over instead of joining an abandoned request.
struct WithdrawOnDrop<'a> {
    slots: &'a DashMap<String, Slot>,
    key: &'a str,
    fetch: Option<SharedFetch>,
}

impl Drop for WithdrawOnDrop<'_> {
    fn drop(&mut self) {
        let Some(fetch) = self.fetch.take() else {
            return;
        };
        let withdrawn = self.slots.remove_if(self.key, |_, slot| {
            matches!(slot, Slot::Pending(pending) if pending.ptr_eq(&fetch))
        });
        if withdrawn.is_some() {
            tracing::debug!("Withdrew abandoned fetch for {}", self.key);
        }
    }
}

/// How a lookup was served
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub value: Value,
    /// Served from a stored entry, no fetch involved
    pub hit: bool,
    /// Joined a fetch started by another caller
    pub coalesced: bool,
}

pub struct ResponseCache {
    slots: DashMap<String, Slot>,
    policy: TtlPolicy,
}

impl ResponseCache {
    pub fn new(policy: TtlPolicy) -> Self {
        Self {
            slots: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// Return the fresh entry for `key`, or run `fetch` once for all concurrent
    /// callers of the same key. Failed fetches are shared but not stored.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        data_type: DataType,
        fetch: F,
    ) -> Result<CacheLookup, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, GatewayError>> + Send + 'static,
    {
        let ttl = self.policy.ttl_for(data_type);

        // Decide under the shard lock, await outside it
        let (shared, coalesced) = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let inflight = match occupied.get() {
                    Slot::Ready(entry) if entry.is_fresh(Instant::now()) => {
                        tracing::debug!("Cache hit for {}", data_type.as_str());
                        return Ok(CacheLookup {
                            value: entry.value.clone(),
                            hit: true,
                            coalesced: false,
                        });
                    }
                    Slot::Pending(inflight) => Some(inflight.clone()),
                    // Expired: treated as absent
                    Slot::Ready(_) => None,
                };
                match inflight {
                    Some(inflight) => (inflight, true),
                    None => {
                        let fut = fetch().boxed().shared();
                        occupied.insert(Slot::Pending(fut.clone()));
                        (fut, false)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let fut = fetch().boxed().shared();
                vacant.insert(Slot::Pending(fut.clone()));
                (fut, false)
            }
        };

        let mut abandon = WithdrawOnDrop {
            slots: &self.slots,
            key,
            fetch: (!coalesced).then(|| shared.clone()),
        };
        let result = shared.clone().await;
        abandon.fetch = None;
        self.settle(key, &shared, &result, ttl, data_type);

        result.map(|value| CacheLookup {
            value,
            hit: false,
            coalesced,
        })
    }

    /// Replace the pending slot with the outcome, unless someone already did
    fn settle(
        &self,
        key: &str,
        fetch: &SharedFetch,
        result: &Result<Value, GatewayError>,
        ttl: Duration,
        data_type: DataType,
    ) {
        if let Entry::Occupied(mut occupied) = self.slots.entry(key.to_string()) {
            let ours = matches!(occupied.get(), Slot::Pending(f) if f.ptr_eq(fetch));
            if !ours {
                return;
            }
            match result {
                Ok(value) => {
                    occupied.insert(Slot::Ready(CacheEntry {
                        key: key.to_string(),
                        value: value.clone(),
                        inserted_at: Instant::now(),
                        ttl,
                        data_type,
                    }));
                }
                Err(_) => {
                    occupied.remove();
                }
            }
        }
    }

    /// Fresh entry for `key`, if any
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        match self.slots.get(key)?.value() {
            Slot::Ready(entry) if entry.is_fresh(Instant::now()) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Drop expired entries; lookups already ignore them
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Ready(entry) => entry.is_fresh(now),
            Slot::Pending(_) => true,
        });
        before - self.slots.len()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
