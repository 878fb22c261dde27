// Per-sender batching queue.
//
// Each sender moves through IDLE -> QUEUED -> PROCESSING -> {IDLE | QUEUED}. Arrivals inside a
// debounce window coalesce into one work unit; a lease keeps one pass in flight per sender,
// except for overload relief passes when the backlog is too deep or too old.

use crate::channels::types::ChannelAttachment;
use crate::core::clock::Clock;
use crate::core::config::QueueSettings;
use crate::core::error::classify;
use crate::core::scheduler::{Scheduler, TimerHandle};
use crate::services::tenant_policy::TenantPolicyCache;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ATTACHMENT_PLACEHOLDER: &str = "[attachment]";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_wait_ms: u64,
    pub overload_depth: usize,
    pub overload_age_ms: i64,
    pub hard_timeout: Duration,
    pub eager_first_message: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 1000,
            overload_depth: 5,
            overload_age_ms: 10_000,
            hard_timeout: Duration::from_secs(300),
            eager_first_message: false,
        }
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            max_wait_ms: settings.max_wait_ms,
            overload_depth: settings.overload_depth.max(1),
            overload_age_ms: settings.overload_age_ms.max(0),
            hard_timeout: Duration::from_secs(settings.hard_timeout_s.max(1)),
            eager_first_message: settings.eager_first_message,
        }
    }
}

/// One inbound message waiting for its sender's next pass.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage {
    pub channel_id: String,
    pub conversation_id: String,
    /// Local record id of the persisted inbound message.
    pub message_id: String,
    pub external_id: Option<String>,
    pub content: String,
    pub attachments: Vec<ChannelAttachment>,
    pub reply_to: Option<String>,
    pub referral: Option<Value>,
    pub received_at: i64,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub payload: QueuedMessage,
    pub enqueued_at: i64,
}

#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub sender_id: String,
    pub tenant_id: String,
    pub channel_id: String,
    pub conversation_id: String,
    pub content: String,
    pub attachments: Vec<ChannelAttachment>,
    pub reply_to: Option<String>,
    pub referral: Option<Value>,
    pub entries: Vec<QueueEntry>,
    pub relief: bool,
}

impl WorkUnit {
    fn build(sender_id: &str, tenant_id: &str, entries: Vec<QueueEntry>, relief: bool) -> Self {
        let content = if entries.len() == 1 {
            entries[0].payload.content.clone()
        } else {
            coalesce_transcript(&entries)
        };
        let attachments = entries
            .iter()
            .flat_map(|entry| entry.payload.attachments.iter().cloned())
            .collect();
        let last = entries.last().map(|entry| &entry.payload);
        let first = entries.first().map(|entry| &entry.payload);
        Self {
            sender_id: sender_id.to_string(),
            tenant_id: tenant_id.to_string(),
            channel_id: first.map(|p| p.channel_id.clone()).unwrap_or_default(),
            conversation_id: first.map(|p| p.conversation_id.clone()).unwrap_or_default(),
            content,
            attachments,
            reply_to: entries
                .iter()
                .rev()
                .find_map(|entry| entry.payload.reply_to.clone()),
            referral: last.and_then(|p| p.referral.clone()).or_else(|| {
                entries
                    .iter()
                    .find_map(|entry| entry.payload.referral.clone())
            }),
            entries,
            relief,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_coalesced(&self) -> bool {
        self.entries.len() > 1
    }
}

/// `[1] first | [2] second`, in arrival order.
pub fn coalesce_transcript(entries: &[QueueEntry]) -> String {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let text = entry.payload.content.trim();
            let text = if text.is_empty() {
                ATTACHMENT_PLACEHOLDER
            } else {
                text
            };
            format!("[{}] {}", index + 1, text)
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process(&self, unit: WorkUnit) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderPhase {
    Idle,
    Queued,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueDecision {
    Dispatched,
    Debounced { delay_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Processed { count: usize },
    Relief { count: usize },
    Failed { count: usize },
    TimedOut { cleared: usize },
    Busy,
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct SenderSnapshot {
    pub phase: SenderPhase,
    pub depth: usize,
    pub oldest_enqueued_at: Option<i64>,
    pub locked: bool,
    pub lock_acquired_at: Option<i64>,
    pub relief_passes: usize,
    pub debounce_pending: bool,
    pub last_touched_at: i64,
}

#[derive(Debug, Clone, Copy)]
struct LockLease {
    generation: u64,
    acquired_at: i64,
}

#[derive(Debug)]
struct PendingDebounce {
    token: u64,
    timer: TimerHandle,
}

#[derive(Debug)]
struct SenderState {
    entries: VecDeque<QueueEntry>,
    tenant_id: String,
    lease: Option<LockLease>,
    relief: HashMap<u64, i64>,
    debounce: Option<PendingDebounce>,
    window_started_at: Option<i64>,
    last_touched_at: i64,
}

impl SenderState {
    fn new(tenant_id: &str, now: i64) -> Self {
        Self {
            entries: VecDeque::new(),
            tenant_id: tenant_id.to_string(),
            lease: None,
            relief: HashMap::new(),
            debounce: None,
            window_started_at: None,
            last_touched_at: now,
        }
    }

    fn phase(&self) -> SenderPhase {
        if self.lease.is_some() || !self.relief.is_empty() {
            SenderPhase::Processing
        } else if !self.entries.is_empty() || self.debounce.is_some() {
            SenderPhase::Queued
        } else {
            SenderPhase::Idle
        }
    }

    fn is_busy(&self) -> bool {
        self.lease.is_some() || !self.relief.is_empty()
    }

    fn cancel_debounce(&mut self) {
        if let Some(pending) = self.debounce.take() {
            pending.timer.cancel();
        }
    }
}

enum Claim {
    Work {
        unit: WorkUnit,
        generation: u64,
    },
    Busy,
    Empty,
}

enum Rearm {
    Now,
    After(u64),
}

struct QueueInner {
    senders: Mutex<HashMap<String, SenderState>>,
    processor: Arc<dyn BatchProcessor>,
    policies: TenantPolicyCache,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    config: QueueConfig,
    generations: AtomicU64,
    tokens: AtomicU64,
}

#[derive(Clone)]
pub struct BatchQueue {
    inner: Arc<QueueInner>,
}

impl BatchQueue {
    pub fn new(
        processor: Arc<dyn BatchProcessor>,
        policies: TenantPolicyCache,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        config: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                senders: Mutex::new(HashMap::new()),
                processor,
                policies,
                clock,
                scheduler,
                config,
                generations: AtomicU64::new(0),
                tokens: AtomicU64::new(0),
            }),
        }
    }

    pub fn enqueue(&self, sender_id: &str, payload: QueuedMessage, tenant_id: &str) -> EnqueueDecision {
        let policy = self.inner.policies.get_policy(tenant_id);
        let now = self.inner.clock.now_ms();
        let config = &self.inner.config;
        let mut senders = self.inner.senders.lock();
        let state = senders
            .entry(sender_id.to_string())
            .or_insert_with(|| SenderState::new(tenant_id, now));
        let was_idle = state.phase() == SenderPhase::Idle;
        state.entries.push_back(QueueEntry {
            payload,
            enqueued_at: now,
        });
        state.tenant_id = tenant_id.to_string();
        state.last_touched_at = now;

        if policy.is_passthrough() {
            state.cancel_debounce();
            drop(senders);
            self.dispatch_now(sender_id);
            return EnqueueDecision::Dispatched;
        }
        if config.eager_first_message && was_idle {
            drop(senders);
            self.dispatch_now(sender_id);
            return EnqueueDecision::Dispatched;
        }

        let wait_ms = policy.batch_wait_ms.min(config.max_wait_ms);
        let window_start = *state.window_started_at.get_or_insert(now);
        let cap_remaining = (window_start + config.max_wait_ms as i64 - now).max(0) as u64;
        let delay_ms = wait_ms.min(cap_remaining);
        self.arm_debounce(sender_id, state, delay_ms);
        debug!(
            "debounce armed: sender_id={sender_id}, tenant_id={tenant_id}, depth={}, delay_ms={delay_ms}",
            state.entries.len()
        );
        EnqueueDecision::Debounced { delay_ms }
    }

    /// Runs one pass for the sender. A held lease yields `Busy` unless the backlog crosses
    /// the overload thresholds, in which case a relief pass runs alongside it.
    pub async fn process_batch(&self, sender_id: &str) -> BatchOutcome {
        let (unit, generation) = match self.claim(sender_id) {
            Claim::Work { unit, generation } => (unit, generation),
            Claim::Busy => return BatchOutcome::Busy,
            Claim::Empty => return BatchOutcome::Empty,
        };
        let relief = unit.relief;
        let count = unit.len();
        let tenant_id = unit.tenant_id.clone();
        let processor = self.inner.processor.clone();
        let result =
            tokio::time::timeout(self.inner.config.hard_timeout, processor.process(unit)).await;
        match result {
            Ok(Ok(())) => {
                self.complete(sender_id, generation, relief);
                if relief {
                    BatchOutcome::Relief { count }
                } else {
                    BatchOutcome::Processed { count }
                }
            }
            Ok(Err(err)) => {
                // Claimed entries are not put back, so a poison message is tried once.
                error!(
                    "batch processing failed: sender_id={sender_id}, tenant_id={tenant_id}, count={count}, code={}, error={err:#}",
                    classify(&err).code()
                );
                self.complete(sender_id, generation, relief);
                BatchOutcome::Failed { count }
            }
            Err(_) => {
                let timeout_s = self.inner.config.hard_timeout.as_secs();
                match self.clear_timed_out(sender_id, generation, relief) {
                    Some(cleared) => {
                        warn!(
                            "batch processing hit hard timeout, sender state cleared: sender_id={sender_id}, tenant_id={tenant_id}, timeout_s={timeout_s}, relief={relief}, dropped={cleared}"
                        );
                        BatchOutcome::TimedOut { cleared }
                    }
                    None => {
                        warn!(
                            "released pass hit hard timeout, newer pass left untouched: sender_id={sender_id}, tenant_id={tenant_id}, timeout_s={timeout_s}, generation={generation}"
                        );
                        BatchOutcome::TimedOut { cleared: 0 }
                    }
                }
            }
        }
    }

    /// Clears state on behalf of a timed-out pass, but only while that pass still holds its lease
    /// or relief slot. A relief pass never takes down the primary lease.
    fn clear_timed_out(&self, sender_id: &str, generation: u64, relief: bool) -> Option<usize> {
        let mut senders = self.inner.senders.lock();
        let state = senders.get_mut(sender_id)?;
        if relief {
            state.relief.remove(&generation)?;
            state.cancel_debounce();
            state.window_started_at = None;
            let dropped = state.entries.len();
            state.entries.clear();
            if !state.is_busy() {
                senders.remove(sender_id);
            }
            return Some(dropped);
        }
        if !state
            .lease
            .is_some_and(|lease| lease.generation == generation)
        {
            return None;
        }
        let mut state = senders.remove(sender_id)?;
        state.cancel_debounce();
        Some(state.entries.len())
    }

    /// Drops all state for the sender, releasing its lease. Returns the number of queued entries dropped.
    pub fn force_clear(&self, sender_id: &str) -> usize {
        let mut senders = self.inner.senders.lock();
        let Some(mut state) = senders.remove(sender_id) else {
            return 0;
        };
        state.cancel_debounce();
        state.entries.len()
    }

    /// Removes idle sender queues untouched for longer than `idle_ceiling`. Busy senders are kept.
    pub fn evict_stale(&self, idle_ceiling: Duration) -> usize {
        let cutoff = self.inner.clock.now_ms() - idle_ceiling.as_millis() as i64;
        let mut senders = self.inner.senders.lock();
        let before = senders.len();
        senders.retain(|sender_id, state| {
            if state.is_busy() || state.last_touched_at >= cutoff {
                return true;
            }
            state.cancel_debounce();
            info!(
                "evicting stale sender queue: sender_id={sender_id}, dropped={}",
                state.entries.len()
            );
            false
        });
        before.saturating_sub(senders.len())
    }

    /// Releases leases held longer than `ceiling`, even when the pass is nominally running.
    pub fn release_stuck_locks(&self, ceiling: Duration) -> usize {
        let cutoff = self.inner.clock.now_ms() - ceiling.as_millis() as i64;
        let mut released = 0;
        let mut rearm = Vec::new();
        {
            let mut senders = self.inner.senders.lock();
            for (sender_id, state) in senders.iter_mut() {
                if state
                    .lease
                    .is_some_and(|lease| lease.acquired_at < cutoff)
                {
                    state.lease = None;
                    released += 1;
                    warn!("released stuck sender lock: sender_id={sender_id}");
                }
                let before = state.relief.len();
                state.relief.retain(|_, acquired_at| *acquired_at >= cutoff);
                released += before - state.relief.len();
                if !state.is_busy() && !state.entries.is_empty() && state.debounce.is_none() {
                    rearm.push(sender_id.clone());
                }
            }
        }
        for sender_id in rearm {
            self.dispatch_now(&sender_id);
        }
        released
    }

    pub fn snapshot(&self, sender_id: &str) -> Option<SenderSnapshot> {
        let senders = self.inner.senders.lock();
        senders.get(sender_id).map(|state| SenderSnapshot {
            phase: state.phase(),
            depth: state.entries.len(),
            oldest_enqueued_at: state.entries.front().map(|entry| entry.enqueued_at),
            locked: state.lease.is_some(),
            lock_acquired_at: state.lease.map(|lease| lease.acquired_at),
            relief_passes: state.relief.len(),
            debounce_pending: state.debounce.is_some(),
            last_touched_at: state.last_touched_at,
        })
    }

    pub fn sender_count(&self) -> usize {
        self.inner.senders.lock().len()
    }

    fn claim(&self, sender_id: &str) -> Claim {
        let now = self.inner.clock.now_ms();
        let config = &self.inner.config;
        let mut senders = self.inner.senders.lock();
        let Some(state) = senders.get_mut(sender_id) else {
            return Claim::Empty;
        };
        if state.entries.is_empty() {
            if !state.is_busy() && state.debounce.is_none() {
                senders.remove(sender_id);
            }
            return Claim::Empty;
        }
        let relief = if state.lease.is_some() {
            let depth = state.entries.len();
            let oldest_age = state
                .entries
                .front()
                .map(|entry| now - entry.enqueued_at)
                .unwrap_or_default();
            if depth <= config.overload_depth && oldest_age <= config.overload_age_ms {
                return Claim::Busy;
            }
            warn!(
                "sender overloaded, running relief pass: sender_id={sender_id}, depth={depth}, oldest_age_ms={oldest_age}"
            );
            true
        } else {
            false
        };

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        if relief {
            state.relief.insert(generation, now);
        } else {
            state.lease = Some(LockLease {
                generation,
                acquired_at: now,
            });
        }
        state.cancel_debounce();
        state.window_started_at = None;
        state.last_touched_at = now;
        let entries: Vec<QueueEntry> = state.entries.drain(..).collect();
        let unit = WorkUnit::build(sender_id, &state.tenant_id, entries, relief);
        Claim::Work { unit, generation }
    }

    fn complete(&self, sender_id: &str, generation: u64, relief: bool) {
        let now = self.inner.clock.now_ms();
        let rearm = {
            let mut senders = self.inner.senders.lock();
            let Some(state) = senders.get_mut(sender_id) else {
                return;
            };
            if relief {
                state.relief.remove(&generation);
            } else if state
                .lease
                .is_some_and(|lease| lease.generation == generation)
            {
                state.lease = None;
            }
            state.last_touched_at = now;
            if state.is_busy() || state.debounce.is_some() {
                None
            } else if state.entries.is_empty() {
                senders.remove(sender_id);
                None
            } else {
                let policy = self.inner.policies.get_policy(&state.tenant_id);
                if policy.is_passthrough() {
                    Some(Rearm::Now)
                } else {
                    let delay_ms = policy.batch_wait_ms.min(self.inner.config.max_wait_ms);
                    state.window_started_at = Some(now);
                    self.arm_debounce(sender_id, state, delay_ms);
                    Some(Rearm::After(delay_ms))
                }
            }
        };
        match rearm {
            Some(Rearm::Now) => self.dispatch_now(sender_id),
            Some(Rearm::After(delay_ms)) => {
                debug!("leftover arrivals re-armed: sender_id={sender_id}, delay_ms={delay_ms}")
            }
            None => {}
        }
    }

    fn arm_debounce(&self, sender_id: &str, state: &mut SenderState, delay_ms: u64) {
        state.cancel_debounce();
        let token = self.inner.tokens.fetch_add(1, Ordering::SeqCst) + 1;
        let queue = self.clone();
        let sender = sender_id.to_string();
        let timer = self.inner.scheduler.schedule(
            Duration::from_millis(delay_ms),
            Box::pin(async move {
                queue.fire_debounce(&sender, token).await;
            }),
        );
        state.debounce = Some(PendingDebounce { token, timer });
    }

    async fn fire_debounce(&self, sender_id: &str, token: u64) {
        let current = {
            let mut senders = self.inner.senders.lock();
            match senders.get_mut(sender_id) {
                Some(state)
                    if state
                        .debounce
                        .as_ref()
                        .is_some_and(|pending| pending.token == token) =>
                {
                    state.debounce = None;
                    true
                }
                _ => false,
            }
        };
        if current {
            self.process_batch(sender_id).await;
        }
    }

    fn dispatch_now(&self, sender_id: &str) {
        let queue = self.clone();
        let sender = sender_id.to_string();
        self.inner.scheduler.spawn(Box::pin(async move {
            queue.process_batch(&sender).await;
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::TokioClock;
    use crate::core::scheduler::TokioScheduler;
    use crate::services::tenant_policy::{PolicySource, TenantPolicy};
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    const SENDER: &str = "user-1";
    const TENANT: &str = "t1";

    struct NoSource;

    #[async_trait]
    impl PolicySource for NoSource {
        async fn load_policy(&self, _tenant_id: &str) -> Result<Option<TenantPolicy>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct RecordingProcessor {
        units: Mutex<Vec<WorkUnit>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        work_time: Duration,
    }

    impl RecordingProcessor {
        fn with_work_time(work_time: Duration) -> Self {
            Self {
                work_time,
                ..Self::default()
            }
        }

        fn contents(&self) -> Vec<String> {
            self.units
                .lock()
                .iter()
                .map(|unit| unit.content.clone())
                .collect()
        }
    }

    #[async_trait]
    impl BatchProcessor for RecordingProcessor {
        async fn process(&self, unit: WorkUnit) -> Result<()> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            let content = unit.content.clone();
            self.units.lock().push(unit);
            if content == "hang" {
                std::future::pending::<()>().await;
            }
            if !self.work_time.is_zero() {
                tokio::time::sleep(self.work_time).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if content.contains("bad") {
                return Err(anyhow!("poison payload"));
            }
            Ok(())
        }
    }

    fn queue_with(
        processor: Arc<RecordingProcessor>,
        policy: TenantPolicy,
        config: QueueConfig,
    ) -> BatchQueue {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::anchored_at(1_700_000_000_000));
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler);
        let policies = TenantPolicyCache::new(
            Arc::new(NoSource),
            clock.clone(),
            scheduler.clone(),
            Duration::from_secs(3600),
        );
        policies.prime(TENANT, policy);
        BatchQueue::new(processor, policies, clock, scheduler, config)
    }

    fn debounced(wait_ms: u64) -> TenantPolicy {
        TenantPolicy {
            automation_enabled: true,
            batch_wait_ms: wait_ms,
        }
    }

    fn message(content: &str) -> QueuedMessage {
        QueuedMessage {
            channel_id: "page-1".to_string(),
            conversation_id: "conv-1".to_string(),
            message_id: format!("local-{content}"),
            external_id: Some(format!("mid.{content}")),
            content: content.to_string(),
            attachments: Vec::new(),
            reply_to: None,
            referral: None,
            received_at: 0,
        }
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_messages_coalesce_into_one_unit() {
        let processor = Arc::new(RecordingProcessor::default());
        let queue = queue_with(processor.clone(), debounced(300), QueueConfig::default());

        for content in ["a", "b", "c"] {
            let decision = queue.enqueue(SENDER, message(content), TENANT);
            assert_eq!(decision, EnqueueDecision::Debounced { delay_ms: 300 });
            advance(100).await;
        }
        // Last arrival at 200ms, window closes at 500ms.
        advance(150).await;
        assert!(processor.contents().is_empty());
        advance(100).await;
        assert_eq!(processor.contents(), vec!["[1] a | [2] b | [3] c".to_string()]);
        assert_eq!(queue.sender_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_is_capped_by_max_wait() {
        let processor = Arc::new(RecordingProcessor::default());
        let queue = queue_with(processor.clone(), debounced(300), QueueConfig::default());

        for index in 0..5 {
            queue.enqueue(SENDER, message(&format!("m{index}")), TENANT);
            advance(200).await;
        }
        // Uncapped the window would close at 1100ms; the cap closes it at 1000ms.
        advance(50).await;
        let contents = processor.contents();
        assert_eq!(contents.len(), 1);
        assert!(contents[0].starts_with("[1] m0"));
        assert!(contents[0].ends_with("[5] m4"));
    }

    #[tokio::test(start_paused = true)]
    async fn passthrough_keeps_single_flight() {
        let processor = Arc::new(RecordingProcessor::with_work_time(Duration::from_millis(100)));
        let queue = queue_with(processor.clone(), TenantPolicy::default(), QueueConfig::default());

        assert_eq!(
            queue.enqueue(SENDER, message("a"), TENANT),
            EnqueueDecision::Dispatched
        );
        advance(10).await;
        queue.enqueue(SENDER, message("b"), TENANT);
        advance(10).await;
        let snapshot = queue.snapshot(SENDER).expect("state");
        assert_eq!(snapshot.phase, SenderPhase::Processing);
        assert_eq!(snapshot.depth, 1);

        advance(300).await;
        assert_eq!(processor.contents(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(queue.sender_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overload_runs_relief_pass_alongside_held_lock() {
        let processor = Arc::new(RecordingProcessor::with_work_time(Duration::from_secs(1)));
        let queue = queue_with(processor.clone(), TenantPolicy::default(), QueueConfig::default());

        queue.enqueue(SENDER, message("m1"), TENANT);
        advance(10).await;
        for index in 2..=7 {
            queue.enqueue(SENDER, message(&format!("m{index}")), TENANT);
        }
        advance(10).await;
        let snapshot = queue.snapshot(SENDER).expect("state");
        assert!(snapshot.locked);
        assert_eq!(snapshot.relief_passes, 1);
        assert_eq!(snapshot.depth, 0);

        advance(2_000).await;
        let units = processor.units.lock().clone();
        assert_eq!(units.len(), 2);
        assert!(!units[0].relief);
        assert!(units[1].relief);
        assert_eq!(units[1].len(), 6);
        assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(queue.sender_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn old_backlog_runs_relief_pass_below_depth_threshold() {
        let processor = Arc::new(RecordingProcessor::with_work_time(Duration::from_secs(30)));
        let config = QueueConfig {
            hard_timeout: Duration::from_secs(120),
            ..QueueConfig::default()
        };
        let queue = queue_with(processor.clone(), TenantPolicy::default(), config);

        queue.enqueue(SENDER, message("m1"), TENANT);
        advance(10).await;
        queue.enqueue(SENDER, message("m2"), TENANT);
        queue.enqueue(SENDER, message("m3"), TENANT);
        advance(10).await;
        assert_eq!(queue.snapshot(SENDER).expect("state").depth, 2);

        // Oldest entry is exactly at the age threshold.
        advance(9_990).await;
        assert_eq!(queue.process_batch(SENDER).await, BatchOutcome::Busy);

        advance(1).await;
        let relief = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_batch(SENDER).await }
        });
        advance(10).await;
        let snapshot = queue.snapshot(SENDER).expect("state");
        assert!(snapshot.locked);
        assert_eq!(snapshot.relief_passes, 1);
        assert_eq!(snapshot.depth, 0);

        assert_eq!(
            relief.await.expect("relief task"),
            BatchOutcome::Relief { count: 2 }
        );
        assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn small_backlog_waits_for_in_flight_pass() {
        let processor = Arc::new(RecordingProcessor::with_work_time(Duration::from_secs(1)));
        let queue = queue_with(processor.clone(), TenantPolicy::default(), QueueConfig::default());

        queue.enqueue(SENDER, message("m1"), TENANT);
        advance(10).await;
        queue.enqueue(SENDER, message("m2"), TENANT);
        queue.enqueue(SENDER, message("m3"), TENANT);
        assert_eq!(queue.process_batch(SENDER).await, BatchOutcome::Busy);

        advance(3_000).await;
        assert_eq!(
            processor.contents(),
            vec!["m1".to_string(), "[1] m2 | [2] m3".to_string()]
        );
        assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_clears_lock_and_queue() {
        let processor = Arc::new(RecordingProcessor::default());
        let config = QueueConfig {
            hard_timeout: Duration::from_secs(5),
            ..QueueConfig::default()
        };
        let queue = queue_with(processor.clone(), TenantPolicy::default(), config);

        queue.enqueue(SENDER, message("hang"), TENANT);
        advance(10).await;
        queue.enqueue(SENDER, message("waiting"), TENANT);
        advance(10).await;
        assert!(queue.snapshot(SENDER).expect("state").locked);

        advance(5_000).await;
        assert!(queue.snapshot(SENDER).is_none());

        queue.enqueue(SENDER, message("after"), TENANT);
        advance(10).await;
        assert_eq!(
            processor.contents(),
            vec!["hang".to_string(), "after".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_of_released_pass_keeps_newer_lease() {
        let processor = Arc::new(RecordingProcessor::with_work_time(Duration::from_secs(4)));
        let config = QueueConfig {
            hard_timeout: Duration::from_secs(5),
            ..QueueConfig::default()
        };
        let queue = queue_with(processor.clone(), TenantPolicy::default(), config);

        queue.enqueue(SENDER, message("hang"), TENANT);
        advance(2_000).await;
        assert_eq!(queue.release_stuck_locks(Duration::from_secs(1)), 1);

        // Second pass runs from 2s to 6s; the first pass times out at 5s.
        queue.enqueue(SENDER, message("slow"), TENANT);
        advance(3_500).await;
        let snapshot = queue.snapshot(SENDER).expect("newer pass still tracked");
        assert!(snapshot.locked);

        queue.enqueue(SENDER, message("third"), TENANT);
        advance(10).await;
        assert_eq!(
            processor.contents(),
            vec!["hang".to_string(), "slow".to_string()]
        );
        assert_eq!(queue.snapshot(SENDER).expect("state").depth, 1);

        advance(5_000).await;
        assert_eq!(
            processor.contents(),
            vec!["hang".to_string(), "slow".to_string(), "third".to_string()]
        );
        assert_eq!(queue.sender_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_unit_releases_lock_and_is_not_retried() {
        let processor = Arc::new(RecordingProcessor::default());
        let queue = queue_with(processor.clone(), TenantPolicy::default(), QueueConfig::default());

        queue.enqueue(SENDER, message("bad"), TENANT);
        advance(10).await;
        assert!(queue.snapshot(SENDER).is_none());

        queue.enqueue(SENDER, message("good"), TENANT);
        advance(10).await;
        assert_eq!(
            processor.contents(),
            vec!["bad".to_string(), "good".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn eager_first_message_skips_debounce_once() {
        let processor = Arc::new(RecordingProcessor::with_work_time(Duration::from_millis(200)));
        let config = QueueConfig {
            eager_first_message: true,
            ..QueueConfig::default()
        };
        let queue = queue_with(processor.clone(), debounced(300), config);

        assert_eq!(
            queue.enqueue(SENDER, message("a"), TENANT),
            EnqueueDecision::Dispatched
        );
        advance(50).await;
        assert!(matches!(
            queue.enqueue(SENDER, message("b"), TENANT),
            EnqueueDecision::Debounced { .. }
        ));
        advance(50).await;
        queue.enqueue(SENDER, message("c"), TENANT);
        advance(1_000).await;
        assert_eq!(
            processor.contents(),
            vec!["a".to_string(), "[1] b | [2] c".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_helpers_release_and_evict() {
        let processor = Arc::new(RecordingProcessor::default());
        let queue = queue_with(processor.clone(), TenantPolicy::default(), QueueConfig::default());

        queue.enqueue(SENDER, message("hang"), TENANT);
        advance(10).await;
        queue.enqueue(SENDER, message("next"), TENANT);
        advance(10).await;
        assert_eq!(queue.release_stuck_locks(Duration::from_secs(60)), 0);

        advance(61_000).await;
        assert_eq!(queue.release_stuck_locks(Duration::from_secs(60)), 1);
        advance(10).await;
        assert_eq!(
            processor.contents(),
            vec!["hang".to_string(), "next".to_string()]
        );

        queue.enqueue("user-2", message("idle"), TENANT);
        assert_eq!(queue.evict_stale(Duration::from_secs(300)), 0);
    }

    #[test]
    fn transcript_marks_attachment_only_entries() {
        let mut image = message("");
        image.attachments.push(ChannelAttachment {
            kind: "image".to_string(),
            url: "https://cdn/x.png".to_string(),
            mime: None,
            name: None,
        });
        let entries = vec![
            QueueEntry {
                payload: message("look"),
                enqueued_at: 0,
            },
            QueueEntry {
                payload: image,
                enqueued_at: 1,
            },
        ];
        assert_eq!(coalesce_transcript(&entries), "[1] look | [2] [attachment]");
        let unit = WorkUnit::build(SENDER, TENANT, entries, false);
        assert_eq!(unit.attachments.len(), 1);
        assert!(unit.is_coalesced());
    }
}
