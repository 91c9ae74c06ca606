//! Cancellable scheduled tasks owned by the governor lifecycle.
//!
//! Every timer in the subsystem (retry backoff, post-close preload, the
//! periodic health check, debounce loops) runs through one scheduler so
//! teardown can cancel them all at once instead of chasing ad-hoc timers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct TaskScheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a task tracked for cancellation. No-op after shutdown.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }

        let handle = tokio::spawn(future);
        let mut handles = self.handles.lock().expect("scheduler lock poisoned");
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Runs `future` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            future.await;
        });
    }

    /// Runs `task` on a fixed interval until cancelled. The first run
    /// happens one full interval after scheduling.
    pub fn schedule_repeating<T, F>(&self, every: Duration, task: T)
    where
        T: Fn() -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send,
    {
        self.spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick of a tokio interval fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                task().await;
            }
        });
    }

    /// Aborts every scheduled task. Further scheduling becomes a no-op.
    pub fn cancel_all(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let mut handles = self.handles.lock().expect("scheduler lock poisoned");
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    /// Number of tasks still tracked (finished tasks are pruned lazily).
    pub fn tracked_tasks(&self) -> usize {
        self.handles.lock().expect("scheduler lock poisoned").len()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn schedule_once_fires_after_delay() {
        let scheduler = TaskScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        scheduler.schedule_once(Duration::from_secs(5), async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_task_ticks_on_interval() {
        let scheduler = TaskScheduler::new();
        let ticks = Arc::new(AtomicU32::new(0));

        let counter = ticks.clone();
        scheduler.schedule_repeating(Duration::from_secs(30), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_pending_tasks() {
        let scheduler = TaskScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        scheduler.schedule_once(Duration::from_secs(5), async move {
            flag.store(true, Ordering::SeqCst);
        });

        scheduler.cancel_all();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));

        // Scheduling after shutdown is a no-op.
        let flag = fired.clone();
        scheduler.schedule_once(Duration::from_millis(1), async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(scheduler.tracked_tasks(), 0);
    }
}
