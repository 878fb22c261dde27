use crate::core::clock::Clock;
use crate::storage::GenerationMeta;
use dashmap::DashMap;
use std::sync::Arc;

/// Short-lived map from external message id to the generation that produced it.
/// Echoes never say who authored them; this lets agent output be tagged once its echo shows up.
#[derive(Clone)]
pub struct GenerationIndex {
    entries: Arc<DashMap<String, (GenerationMeta, i64)>>,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
}

impl GenerationIndex {
    pub fn new(clock: Arc<dyn Clock>, ttl_ms: i64) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
            ttl_ms,
        }
    }

    pub fn tag(&self, external_id: &str, meta: GenerationMeta) {
        let cleaned = external_id.trim();
        if cleaned.is_empty() {
            return;
        }
        self.entries
            .insert(cleaned.to_string(), (meta, self.clock.now_ms()));
    }

    pub fn get(&self, external_id: &str) -> Option<GenerationMeta> {
        let now = self.clock.now_ms();
        self.entries
            .get(external_id.trim())
            .filter(|entry| now - entry.1 <= self.ttl_ms)
            .map(|entry| entry.0.clone())
    }

    pub fn take(&self, external_id: &str) -> Option<GenerationMeta> {
        let now = self.clock.now_ms();
        self.entries
            .remove(external_id.trim())
            .filter(|(_, (_, tagged_at))| now - tagged_at <= self.ttl_ms)
            .map(|(_, (meta, _))| meta)
    }

    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now_ms() - self.ttl_ms;
        let before = self.entries.len();
        self.entries.retain(|_, (_, tagged_at)| *tagged_at >= cutoff);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
