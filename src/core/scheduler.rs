use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type ScheduledTask = BoxFuture<'static, ()>;

/// Runs deferred work. Timers can be cancelled until they fire.
pub trait Scheduler: Send + Sync {
    fn spawn(&self, task: ScheduledTask);

    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TimerHandle;
}

#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    sleeper: Option<tokio::task::AbortHandle>,
}

impl TimerHandle {
    pub fn new(sleeper: Option<tokio::task::AbortHandle>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            sleeper,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Only the sleep is aborted; a task that already fired runs on its own task.
        if let Some(sleeper) = self.sleeper.as_ref() {
            sleeper.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn spawn(&self, task: ScheduledTask) {
        tokio::spawn(task);
    }

    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TimerHandle {
        let mut handle = TimerHandle::new(None);
        let cancelled = handle.flag();
        let sleeper = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            tokio::spawn(task);
        });
        handle.sleeper = Some(sleeper.abort_handle());
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn scheduled_task_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let scheduler = TokioScheduler;
        let _handle = scheduler.schedule(
            Duration::from_millis(300),
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tokio::time::sleep(Duration::from_millis(299)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let scheduler = TokioScheduler;
        let handle = scheduler.schedule(
            Duration::from_millis(300),
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
