// Inbound dedup gate: remembers delivered message ids for a retention window.

use crate::core::clock::Clock;
use anyhow::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub trait DedupStore: Send + Sync {
    /// Records `key` as seen at `now` unless a live entry exists. Entries first seen
    /// before `expired_before` count as absent and are overwritten.
    /// Returns true when the key was newly recorded.
    fn mark_if_absent(&self, key: &str, now: i64, expired_before: i64) -> Result<bool>;

    /// Drops entries first seen before `expired_before`, returning how many were removed.
    fn evict_before(&self, expired_before: i64) -> Result<usize>;

    fn len(&self) -> usize;
}

#[derive(Default)]
pub struct MemoryDedupStore {
    seen: DashMap<String, i64>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DedupStore for MemoryDedupStore {
    fn mark_if_absent(&self, key: &str, now: i64, expired_before: i64) -> Result<bool> {
        match self.seen.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(now);
                Ok(true)
            }
            Entry::Occupied(mut entry) => {
                if *entry.get() < expired_before {
                    entry.insert(now);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn evict_before(&self, expired_before: i64) -> Result<usize> {
        let before = self.seen.len();
        self.seen.retain(|_, first_seen| *first_seen >= expired_before);
        Ok(before.saturating_sub(self.seen.len()))
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn DedupStore>,
    clock: Arc<dyn Clock>,
    retention_ms: i64,
}

impl DedupGate {
    pub fn new(store: Arc<dyn DedupStore>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention_ms: retention.as_millis() as i64,
        }
    }

    pub fn in_memory(clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self::new(Arc::new(MemoryDedupStore::new()), clock, retention)
    }

    /// Marks the id seen before returning, so concurrent retries of one delivery
    /// cannot both pass. Events without an id always pass.
    pub fn should_process(&self, external_id: Option<&str>) -> bool {
        let Some(key) = external_id.map(str::trim).filter(|value| !value.is_empty()) else {
            return true;
        };
        let now = self.clock.now_ms();
        match self
            .store
            .mark_if_absent(key, now, now - self.retention_ms)
        {
            Ok(fresh) => {
                if !fresh {
                    debug!("dedup drop duplicate delivery: external_id={key}");
                }
                fresh
            }
            Err(err) => {
                warn!("dedup store unavailable, letting event through: external_id={key}, error={err}");
                true
            }
        }
    }

    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now_ms() - self.retention_ms;
        match self.store.evict_before(cutoff) {
            Ok(evicted) => {
                if evicted > 0 {
                    debug!("dedup sweep evicted {evicted} entries");
                }
                evicted
            }
            Err(err) => {
                warn!("dedup sweep failed: {err}");
                0
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.store.len()
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let gate = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gate.sweep();
            }
        })
    }
}
