//! Drift-corrected timing and cancellable scheduled tasks.
//!
//! [`DriftClock`] measures every deadline from one fixed start instant, so time spent
//! doing work in one step shortens the next sleep instead of pushing every later step
//! back. All instants come from `tokio::time`, which keeps the clock controllable in
//! tests.

use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Monotonic clock with a fixed step period.
#[derive(Debug, Clone, Copy)]
pub struct DriftClock {
    start: Instant,
    period: Duration,
}

impl DriftClock {
    /// Start a clock now.
    pub fn start(period: Duration) -> Self {
        Self {
            start: Instant::now(),
            period,
        }
    }

    /// When the clock was started
    pub fn started_at(&self) -> Instant {
        self.start
    }

    /// Tick length
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Time since start
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Nominal instant of `step`.
    pub fn deadline(&self, step: u32) -> Instant {
        self.start + self.period * step
    }

    /// Time left until `step`, zero if it already passed.
    pub fn delay_until_step(&self, step: u32) -> Duration {
        self.deadline(step).saturating_duration_since(Instant::now())
    }

    /// `period - (elapsed mod period)`: time to the next period boundary.
    pub fn delay_to_next_tick(&self) -> Duration {
        let period = self.period.as_nanos();
        if period == 0 {
            return Duration::ZERO;
        }
        let into_period = self.elapsed().as_nanos() % period;
        Duration::from_nanos((period - into_period) as u64)
    }

    /// Sleep until the deadline of `step`.
    pub async fn sleep_until_step(&self, step: u32) {
        time::sleep_until(self.deadline(step)).await;
    }

    /// Sleep until the next tick boundary.
    pub async fn sleep_to_next_tick(&self) {
        time::sleep(self.delay_to_next_tick()).await;
    }
}

/// Spawns futures after a delay on one runtime.
#[derive(Debug, Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    /// Scheduler spawning onto `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the runtime of the calling task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Run `future` once `delay` has passed.
    pub fn schedule<F>(&self, delay: Duration, future: F) -> CancelHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let task = self.handle.spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            future.await
        });
        CancelHandle { task }
    }
}

/// Handle to a scheduled task.
#[derive(Debug)]
pub struct CancelHandle<T> {
    task: JoinHandle<T>,
}

impl<T> CancelHandle<T> {
    /// Stop the task at its next await point.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// True once the task has completed or been cancelled
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task. `None` if it was cancelled or panicked.
    pub async fn join(self) -> Option<T> {
        match self.task.await {
            Ok(value) => Some(value),
            Err(e) => {
                if e.is_panic() {
                    tracing::error!("scheduled task panicked: {}", e);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_drift_does_not_accumulate() {
        let clock = DriftClock::start(Duration::from_millis(100));
        for step in 1..=50u32 {
            // work of varying length inside every step
            time::sleep(Duration::from_millis(u64::from(step % 7) * 10)).await;
            clock.sleep_until_step(step).await;
        }
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_tick_delay() {
        let clock = DriftClock::start(Duration::from_secs(3));
        time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(clock.delay_to_next_tick(), Duration::from_millis(2500));
        assert_eq!(clock.delay_until_step(1), Duration::ZERO);
        assert_eq!(clock.delay_until_step(2), Duration::from_millis(2500));
    }

    #[test]
    fn test_zero_period_never_waits() {
        let clock = DriftClock {
            start: Instant::now(),
            period: Duration::ZERO,
        };
        assert_eq!(clock.delay_to_next_tick(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_after_delay() {
        let scheduler = Scheduler::current();
        let start = Instant::now();
        let handle = scheduler.schedule(Duration::from_secs(2), async move { start.elapsed() });
        assert_eq!(handle.join().await, Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_run() {
        let scheduler = Scheduler::current();
        let handle = scheduler.schedule(Duration::from_secs(60), async { 1 });
        handle.cancel();
        assert_eq!(handle.join().await, None);
    }
}
