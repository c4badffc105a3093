use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time source shared by the limiter and the credential validator.
///
/// `monotonic` drives elapsed-time arithmetic and must never be compared with
/// wall time. `now_utc` is only used for token timestamps.
pub trait Clock: Send + Sync + Debug {
    fn monotonic(&self) -> Duration;
    fn now_utc(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
struct ManualState {
    wall: DateTime<Utc>,
    monotonic: Duration,
}

/// Hand-driven clock for tests and simulations. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                wall: start,
                monotonic: Duration::ZERO,
            })),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Moves both readings forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.monotonic += by;
        state.wall += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    /// Moves the monotonic reading backwards, as a misbehaving source would.
    pub fn rewind(&self, by: Duration) {
        let mut state = self.lock();
        state.monotonic = state.monotonic.saturating_sub(by);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.lock().monotonic
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.lock().wall
    }
}
