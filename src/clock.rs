//! Injectable time source.
//!
//! Every time-sensitive processor (Batcher, Windowers, Throttle, Debounce,
//! Retry, CircuitBreaker, DeadLetterQueue) takes a [`Clock`] instead of
//! calling `tokio::time` directly. In production code pass [`Clock::real`];
//! in tests pass the handle returned by [`Clock::fake`] and drive it with
//! [`FakeClock::advance`] so that timer-dependent output is fully
//! deterministic (§8, property 5 of the design).
//!
//! `Clock` is a small closed enum rather than a `dyn Trait` — there are
//! exactly two implementations and dispatching on a concrete enum avoids a
//! virtual call on every `now()` in hot paths (CircuitBreaker, DLQ).

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero())
}

fn to_std(d: ChronoDuration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

/// A time source: either the real OS clock or a virtual, test-driven clock.
#[derive(Clone)]
pub enum Clock {
    /// Wall-clock time via `tokio::time`.
    Real,
    /// Virtual time, advanced explicitly by a test.
    Fake(FakeClock),
}

impl Clock {
    /// The real clock. Timers and tickers built on it fire in wall-clock time.
    pub fn real() -> Self {
        Clock::Real
    }

    /// Create a fake clock paired with a handle for driving it from tests.
    pub fn fake() -> (Self, FakeClock) {
        let fake = FakeClock::new();
        (Clock::Fake(fake.clone()), fake)
    }

    /// The current time according to this clock.
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::Real => Utc::now(),
            Clock::Fake(f) => f.now(),
        }
    }

    /// Sleep for `d` according to this clock.
    pub async fn sleep(&self, d: Duration) {
        match self {
            Clock::Real => tokio::time::sleep(d).await,
            Clock::Fake(f) => f.sleep(d).await,
        }
    }

    /// Create a one-shot [`Timer`] that fires `d` from now.
    pub fn new_timer(&self, d: Duration) -> Timer {
        Timer::new(self.clone(), d)
    }

    /// Create a periodic [`Ticker`] with period `d`.
    pub fn new_ticker(&self, d: Duration) -> Ticker {
        Ticker::new(self.clone(), d)
    }

    /// Spawn a task that invokes `f` once, `d` from now. Returns a
    /// [`tokio::task::JoinHandle`] the caller may abort to cancel it.
    pub fn after_func<F>(&self, d: Duration, f: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let clock = self.clone();
        tokio::spawn(async move {
            clock.sleep(d).await;
            f();
        })
    }
}

/// A one-shot timer. Supports the two-phase select idiom: check
/// [`Timer::is_ready`] non-blockingly before falling back to a full
/// `tokio::select!` that awaits [`Timer::recv`].
pub struct Timer {
    clock: Clock,
    /// `None` means stopped: never ready, `recv` never resolves until reset.
    deadline: Option<DateTime<Utc>>,
}

impl Timer {
    fn new(clock: Clock, d: Duration) -> Self {
        let deadline = clock.now() + to_chrono(d);
        Self {
            clock,
            deadline: Some(deadline),
        }
    }

    /// Non-blocking check: has the deadline already passed?
    pub fn is_ready(&self) -> bool {
        match self.deadline {
            Some(dl) => self.clock.now() >= dl,
            None => false,
        }
    }

    /// Wait for the timer to fire, returning the time it fired at. A
    /// stopped timer (via [`Timer::stop`]) never resolves until reset.
    pub async fn recv(&mut self) -> DateTime<Utc> {
        loop {
            match self.deadline {
                None => {
                    futures::future::pending::<()>().await;
                    unreachable!("pending future never resolves");
                }
                Some(dl) => {
                    let now = self.clock.now();
                    if now >= dl {
                        return now;
                    }
                    self.clock.sleep(to_std(dl - now)).await;
                }
            }
        }
    }

    /// Reschedule the timer to fire `d` from now.
    pub fn reset(&mut self, d: Duration) {
        self.deadline = Some(self.clock.now() + to_chrono(d));
    }

    /// Stop the timer. It will not fire again until [`Timer::reset`].
    pub fn stop(&mut self) {
        self.deadline = None;
    }
}

/// A periodic timer. Each [`Ticker::tick`] reschedules the next firing
/// relative to the *previous scheduled* instant, not to when the tick
/// was observed, so ticks do not drift under load.
pub struct Ticker {
    clock: Clock,
    period: Duration,
    next: DateTime<Utc>,
}

impl Ticker {
    fn new(clock: Clock, period: Duration) -> Self {
        let next = clock.now() + to_chrono(period);
        Self {
            clock,
            period,
            next,
        }
    }

    /// Non-blocking check: has the next tick already passed?
    pub fn is_ready(&self) -> bool {
        self.clock.now() >= self.next
    }

    /// Wait for the next tick, returning the time it fired at.
    pub async fn tick(&mut self) -> DateTime<Utc> {
        loop {
            let now = self.clock.now();
            if now >= self.next {
                let fired = self.next;
                self.next = fired + to_chrono(self.period);
                return fired;
            }
            self.clock.sleep(to_std(self.next - now)).await;
        }
    }
}

/// A virtual clock for deterministic tests. Cloning shares the same
/// underlying time; only [`FakeClock::advance`] moves it forward.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<FakeClockInner>,
}

struct FakeClockInner {
    now: parking_lot::Mutex<DateTime<Utc>>,
    notify: Notify,
    sleeping: AtomicUsize,
}

impl FakeClock {
    /// Create a new fake clock starting at the Unix epoch.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FakeClockInner {
                // `(0, 0)` is the Unix epoch, always a single valid instant.
                #[allow(clippy::unwrap_used)]
                now: parking_lot::Mutex::new(Utc.timestamp_opt(0, 0).single().unwrap()),
                notify: Notify::new(),
                sleeping: AtomicUsize::new(0),
            }),
        }
    }

    /// The current virtual time.
    pub fn now(&self) -> DateTime<Utc> {
        *self.inner.now.lock()
    }

    /// Advance virtual time by `d` and wake every task blocked in
    /// [`FakeClock::sleep`]/[`FakeClock::wait_until`] whose deadline has
    /// now passed.
    pub fn advance(&self, d: Duration) {
        {
            let mut now = self.inner.now.lock();
            *now += to_chrono(d);
        }
        self.inner.notify.notify_waiters();
    }

    /// Sleep until `d` from the current virtual time.
    pub async fn sleep(&self, d: Duration) {
        let deadline = self.now() + to_chrono(d);
        self.wait_until(deadline).await;
    }

    /// Sleep until virtual time reaches `deadline`.
    pub async fn wait_until(&self, deadline: DateTime<Utc>) {
        loop {
            let notified = self.inner.notify.notified();
            if self.now() >= deadline {
                return;
            }
            self.inner.sleeping.fetch_add(1, Ordering::SeqCst);
            notified.await;
            self.inner.sleeping.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Yield to the executor until every task that was woken by the most
    /// recent [`FakeClock::advance`] has had a chance to run. This is a
    /// best-effort barrier, not a precise one: it yields a bounded number
    /// of times rather than tracking a dependency graph of waiters.
    pub async fn block_until_ready(&self) {
        for _ in 0..128 {
            tokio::task::yield_now().await;
            if self.inner.sleeping.load(Ordering::SeqCst) == 0 {
                // One extra round-trip so tasks that just woke up can act
                // on the new time before we return control to the test.
                tokio::task::yield_now().await;
                return;
            }
        }
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_clock_advances_monotonically() {
        let (clock, fake) = Clock::fake();
        let t0 = clock.now();
        fake.advance(Duration::from_millis(100));
        assert!(clock.now() > t0);
    }

    #[tokio::test]
    async fn timer_fires_after_advance() {
        let (clock, fake) = Clock::fake();
        let mut timer = clock.new_timer(Duration::from_millis(50));
        assert!(!timer.is_ready());

        let handle = tokio::spawn(async move {
            timer.recv().await;
            timer
        });

        tokio::task::yield_now().await;
        fake.advance(Duration::from_millis(50));
        fake.block_until_ready().await;

        let timer = handle.await.unwrap();
        // recv() doesn't reset the deadline, so it stays ready after firing.
        assert!(timer.is_ready());
    }

    #[tokio::test]
    async fn ticker_does_not_drift_relative_to_schedule() {
        let (clock, fake) = Clock::fake();
        let mut ticker = clock.new_ticker(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let first = ticker.tick().await;
            let second = ticker.tick().await;
            (first, second)
        });

        tokio::task::yield_now().await;
        fake.advance(Duration::from_millis(10));
        fake.block_until_ready().await;
        fake.advance(Duration::from_millis(10));
        fake.block_until_ready().await;

        let (first, second) = handle.await.unwrap();
        assert_eq!(second - first, ChronoDuration::milliseconds(10));
    }

    #[tokio::test]
    async fn stopped_timer_never_fires() {
        let (clock, _fake) = Clock::fake();
        let mut timer = clock.new_timer(Duration::from_millis(10));
        timer.stop();
        assert!(!timer.is_ready());

        let fired = tokio::time::timeout(Duration::from_millis(20), timer.recv()).await;
        assert!(fired.is_err(), "a stopped timer must not fire");
    }
}
