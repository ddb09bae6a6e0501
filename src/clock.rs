//! Clock and timer abstraction.
//!
//! Both loops only suspend through a [`Clock`]: the ingestor's settling delay
//! and the worker's poll interval. Production code uses [`SystemClock`]; tests
//! use [`ManualClock`], whose `sleep` advances virtual time after a single yield.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of the current time and of suspension.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Wall clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Virtual clock for deterministic tests. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    slept: Duration,
    sleeps: usize,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: start,
                slept: Duration::ZERO,
                sleeps: 0,
            })),
        }
    }

    /// Move virtual time forward without sleeping.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.now = forward(state.now, by);
    }

    /// Total virtual time spent in `sleep`.
    pub fn slept(&self) -> Duration {
        self.lock().slept
    }

    /// Number of `sleep` calls so far.
    pub fn sleeps(&self) -> usize {
        self.lock().sleeps
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<ManualState>) -> MutexGuard<'_, ManualState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    /// Time moves only once the sleep completes; a sleep dropped by a losing
    /// `select!` branch leaves the clock untouched.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        let state = Arc::clone(&self.state);
        async move {
            // Yield so a spawned loop driven by this clock cannot starve the runtime.
            tokio::task::yield_now().await;
            let mut state = lock(&state);
            state.now = forward(state.now, duration);
            state.slept += duration;
            state.sleeps += 1;
        }
    }
}

fn forward(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
