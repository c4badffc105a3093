use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ConfigError;
use crate::utils::clock::SharedClock;

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

/// Per-client admission decision. The in-process [`RateLimiter`] is the only
/// implementation here; a shared counter store can slot in behind the same
/// trait when the service runs on more than one node.
pub trait AdmissionControl: Send + Sync + Debug {
    fn admit(&self, key: &str) -> Admission;

    /// Drops state for idle clients, returning how many entries went away.
    fn sweep(&self) -> usize {
        0
    }
}

/// Validated limiter constants. Only constructible with positive values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    max_tokens: u32,
    refill_rate: u32,
    idle_ttl: Duration,
}

impl BucketConfig {
    pub fn new(max_tokens: i64, refill_rate: i64, idle_ttl: Duration) -> Result<Self, ConfigError> {
        let max_tokens = positive("max_tokens", max_tokens)?;
        let refill_rate = positive("refill_rate", refill_rate)?;
        let cfg = Self {
            max_tokens,
            refill_rate,
            idle_ttl,
        };
        let window = cfg.refill_window();
        if idle_ttl < window {
            return Err(ConfigError::IdleTtlTooShort {
                ttl_secs: idle_ttl.as_secs(),
                refill_window_secs: window.as_secs(),
            });
        }
        Ok(cfg)
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn refill_rate(&self) -> u32 {
        self.refill_rate
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    /// Time for an empty bucket to fill completely.
    pub fn refill_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_tokens).div_ceil(u64::from(self.refill_rate)))
    }
}

fn positive(field: &'static str, value: i64) -> Result<u32, ConfigError> {
    match u32::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(ConfigError::NonPositive { field, value }),
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: u32,
    last_refill: Duration,
    // Sub-token credit in nanosecond-token units, always below one token.
    residue: u128,
    last_seen: Duration,
}

impl Bucket {
    fn full(cfg: &BucketConfig, now: Duration) -> Self {
        Self {
            tokens: cfg.max_tokens,
            last_refill: now,
            residue: 0,
            last_seen: now,
        }
    }

    // Credits whole tokens and keeps the exact remainder for the next call.
    // A full bucket banks nothing. The mark never moves backwards, so time
    // lost to a rewinding clock is not counted twice.
    fn refill(&mut self, now: Duration, cfg: &BucketConfig) {
        let elapsed = now.saturating_sub(self.last_refill).as_nanos();
        self.last_refill = self.last_refill.max(now);

        let credit = elapsed * u128::from(cfg.refill_rate) + self.residue;
        let accrued = credit / NANOS_PER_SEC;
        let total = u128::from(self.tokens) + accrued;
        if total >= u128::from(cfg.max_tokens) {
            self.tokens = cfg.max_tokens;
            self.residue = 0;
        } else {
            self.tokens = total as u32;
            self.residue = credit % NANOS_PER_SEC;
        }
    }
}

/// Continuous token bucket keyed by client address, guarded by one registry lock.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: BucketConfig,
    clock: SharedClock,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl RateLimiter {
    pub fn new(config: BucketConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn tracked_clients(&self) -> usize {
        self.lock().len()
    }

    /// Current token count for `key`, without refilling.
    pub fn tokens(&self, key: &str) -> Option<u32> {
        self.lock().get(key).map(|b| b.tokens)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        match self.buckets.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }
}

impl AdmissionControl for RateLimiter {
    fn admit(&self, key: &str) -> Admission {
        let mut buckets = self.lock();
        // read the clock under the lock so refills are applied in time order
        let now = self.clock.monotonic();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::full(&self.config, now));
        bucket.refill(now, &self.config);
        bucket.last_seen = now;
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            Admission::Admitted
        } else {
            Admission::Rejected
        }
    }

    fn sweep(&self) -> usize {
        let now = self.clock.monotonic();
        let ttl = self.config.idle_ttl;
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_sub(b.last_seen) < ttl);
        before - buckets.len()
    }
}

/// Periodically evicts idle buckets so the registry does not grow without bound.
pub fn spawn_bucket_sweeper(limiter: Arc<dyn AdmissionControl>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = limiter.sweep();
            if evicted > 0 {
                debug!(evicted, "swept idle rate-limit buckets");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;
    use proptest::prelude::*;
    use std::sync::Barrier;

    fn limiter(max: i64, rate: i64) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::starting_now();
        let cfg = BucketConfig::new(max, rate, Duration::from_secs(600)).unwrap();
        (RateLimiter::new(cfg, Arc::new(clock.clone())), clock)
    }

    fn admitted(limiter: &RateLimiter, key: &str, n: usize) -> usize {
        (0..n)
            .filter(|_| limiter.admit(key) == Admission::Admitted)
            .count()
    }

    #[test]
    fn rejects_non_positive_constants() {
        let ttl = Duration::from_secs(600);
        assert_eq!(
            BucketConfig::new(0, 1, ttl),
            Err(ConfigError::NonPositive { field: "max_tokens", value: 0 })
        );
        assert_eq!(
            BucketConfig::new(10, -3, ttl),
            Err(ConfigError::NonPositive { field: "refill_rate", value: -3 })
        );
    }

    #[test]
    fn rejects_ttl_shorter_than_refill_window() {
        let err = BucketConfig::new(100, 1, Duration::from_secs(30)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::IdleTtlTooShort { ttl_secs: 30, refill_window_secs: 100 }
        );
    }

    #[test]
    fn new_client_starts_full() {
        let (rl, _clock) = limiter(5, 1);
        assert_eq!(rl.admit("10.0.0.1"), Admission::Admitted);
        assert_eq!(rl.tokens("10.0.0.1"), Some(4));
    }

    #[test]
    fn burst_then_reject() {
        let (rl, _clock) = limiter(100, 1);
        assert_eq!(admitted(&rl, "a", 150), 100);
        assert_eq!(rl.admit("a"), Admission::Rejected);
    }

    #[test]
    fn clients_are_isolated() {
        let (rl, _clock) = limiter(2, 1);
        assert_eq!(admitted(&rl, "a", 5), 2);
        assert_eq!(admitted(&rl, "b", 5), 2);
    }

    #[test]
    fn idle_time_refills_whole_tokens() {
        let (rl, clock) = limiter(100, 1);
        assert_eq!(admitted(&rl, "a", 150), 100);
        clock.advance(Duration::from_secs(10));
        assert_eq!(admitted(&rl, "a", 5), 5);
        assert_eq!(rl.tokens("a"), Some(5));
    }

    #[test]
    fn fractional_time_is_carried_over() {
        let (rl, clock) = limiter(10, 1);
        assert_eq!(admitted(&rl, "a", 10), 10);

        // three steps of 0.4s add up to one whole token, then 0.2s of credit remains
        for _ in 0..3 {
            clock.advance(Duration::from_millis(400));
            rl.admit("a");
        }
        assert_eq!(rl.tokens("a"), Some(0));

        clock.advance(Duration::from_millis(800));
        assert_eq!(rl.admit("a"), Admission::Admitted);
    }

    #[test]
    fn uneven_rate_loses_no_time() {
        let cfg = BucketConfig::new(10, 3, Duration::from_secs(600)).unwrap();
        let mut bucket = Bucket::full(&cfg, Duration::ZERO);
        bucket.tokens = 0;

        let mut now = Duration::ZERO;
        for step in [333_333_333, 333_333_333, 333_333_334] {
            now += Duration::from_nanos(step);
            bucket.refill(now, &cfg);
        }
        assert_eq!(bucket.tokens, 3);
        assert_eq!(bucket.residue, 0);
    }

    #[test]
    fn many_small_steps_match_one_large_step() {
        let cfg = BucketConfig::new(1_000, 7, Duration::from_secs(600)).unwrap();
        let mut stepped = Bucket::full(&cfg, Duration::ZERO);
        stepped.tokens = 0;
        let mut single = stepped.clone();

        let mut now = Duration::ZERO;
        for _ in 0..10_000 {
            now += Duration::from_nanos(1_234_567);
            stepped.refill(now, &cfg);
        }
        single.refill(now, &cfg);
        assert_eq!(stepped.tokens, single.tokens);
        assert_eq!(stepped.residue, single.residue);
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let (rl, clock) = limiter(3, 2);
        rl.admit("a");
        clock.advance(Duration::from_secs(3600));
        assert_eq!(admitted(&rl, "a", 10), 3);
    }

    #[test]
    fn clock_going_backwards_is_clamped() {
        let (rl, clock) = limiter(2, 1);
        clock.advance(Duration::from_secs(5));
        assert_eq!(admitted(&rl, "a", 2), 2);
        clock.rewind(Duration::from_secs(5));
        assert_eq!(rl.admit("a"), Admission::Rejected);
        assert_eq!(rl.tokens("a"), Some(0));
    }

    #[test]
    fn sweep_evicts_only_idle_clients() {
        let (rl, clock) = limiter(10, 1);
        rl.admit("stale");
        clock.advance(Duration::from_secs(599));
        rl.admit("fresh");
        clock.advance(Duration::from_secs(1));

        assert_eq!(rl.sweep(), 1);
        assert_eq!(rl.tracked_clients(), 1);
        assert!(rl.tokens("stale").is_none());
        assert!(rl.tokens("fresh").is_some());
    }

    #[test]
    fn parallel_admissions_are_exact() {
        const N: usize = 64;
        const K: usize = 36;
        let (rl, _clock) = limiter(N as i64, 1);
        let barrier = Barrier::new(N + K);

        let results: Vec<Admission> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..N + K)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        rl.admit("shared")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ok = results.iter().filter(|a| **a == Admission::Admitted).count();
        assert_eq!(ok, N);
        assert_eq!(results.len() - ok, K);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_evicts_in_background() {
        let (rl, clock) = limiter(10, 1);
        rl.admit("a");
        clock.advance(Duration::from_secs(601));

        let shared: Arc<dyn AdmissionControl> = Arc::new(rl.clone());
        let handle = spawn_bucket_sweeper(shared, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(rl.tracked_clients(), 0);
        handle.abort();
    }

    proptest! {
        #[test]
        fn tokens_stay_within_bounds(
            max in 1i64..50,
            rate in 1i64..20,
            steps in proptest::collection::vec((0u64..3_000, 0usize..8), 1..60),
        ) {
            let (rl, clock) = limiter(max, rate);
            for (advance_ms, requests) in steps {
                clock.advance(Duration::from_millis(advance_ms));
                for _ in 0..requests {
                    rl.admit("k");
                    let tokens = rl.tokens("k").unwrap();
                    prop_assert!(i64::from(tokens) <= max);
                }
            }
        }

        #[test]
        fn admissions_bounded_by_capacity_plus_refill(
            max in 1i64..50,
            rate in 1i64..20,
            steps in proptest::collection::vec((0u64..2_000, 0usize..10), 1..40),
        ) {
            let (rl, clock) = limiter(max, rate);
            let mut elapsed = Duration::ZERO;
            let mut ok = 0u64;
            for (advance_ms, requests) in steps {
                let step = Duration::from_millis(advance_ms);
                clock.advance(step);
                elapsed += step;
                ok += admitted(&rl, "k", requests) as u64;
            }
            let bound = max as f64 + (rate as f64 * elapsed.as_secs_f64()).ceil();
            prop_assert!(ok as f64 <= bound);
        }
    }
}
