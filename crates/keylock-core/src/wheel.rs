//! Tick-driven timeout wheel.
//!
//! Deadlines are bucketed by absolute tick, so a stalled process fires late but never
//! loses an expiry. Entries are never removed proactively: the owner keeps a liveness
//! map and ignores fired ids that were already resolved through another path.
//!
//! The wheel does not own a clock. Ticks come from a [`Ticker`], which is either a
//! spawned interval task (one tick per second in production) or a manual handle in tests.

use std::{collections::BTreeMap, time::Duration};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

/// A point on the wheel's tick counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(u64);

impl Tick {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The tick `ticks` after this one.
    #[must_use]
    pub const fn after(self, ticks: u64) -> Self {
        Self(self.0.saturating_add(ticks))
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deadline scheduler keyed by absolute tick.
#[derive(Debug)]
pub struct TimeoutWheel<K> {
    now: Tick,
    buckets: BTreeMap<Tick, Vec<K>>,
}

impl<K> Default for TimeoutWheel<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimeoutWheel<K> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            now: Tick(0),
            buckets: BTreeMap::new(),
        }
    }

    /// Current tick.
    #[must_use]
    pub const fn now(&self) -> Tick {
        self.now
    }

    /// Deadline `secs` ticks from now.
    #[must_use]
    pub const fn deadline_after(&self, secs: u64) -> Tick {
        self.now.after(secs)
    }

    /// Number of scheduled (not yet fired) entries, including ones whose owner already
    /// resolved them.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Register a one-shot expiry for `id` at `deadline`.
    ///
    /// A deadline at or before the current tick is moved to the next tick, so a zero
    /// timeout still fires. Returns the tick the entry was actually placed on.
    pub fn schedule(&mut self, deadline: Tick, id: K) -> Tick {
        let deadline = deadline.max(self.now.after(1));
        self.buckets.entry(deadline).or_default().push(id);
        deadline
    }

    /// Advance exactly one tick, handing every id due on the new tick to `on_fire`.
    pub fn advance(&mut self, mut on_fire: impl FnMut(K)) -> Tick {
        self.now = self.now.after(1);
        if let Some(due) = self.buckets.remove(&self.now) {
            due.into_iter().for_each(&mut on_fire);
        }
        self.now
    }

    /// Catch up to `target`, firing each intermediate bucket in tick order.
    pub fn advance_to(&mut self, target: Tick, mut on_fire: impl FnMut(K)) -> Tick {
        while self.now < target {
            self.advance(&mut on_fire);
        }
        self.now
    }
}

/// Source of wheel ticks.
#[derive(Debug)]
pub struct Ticker {
    rx: mpsc::UnboundedReceiver<()>,
    task: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn an interval task producing one tick per `period`.
    ///
    /// Missed ticks are delivered in a burst after a stall rather than skipped.
    #[must_use]
    pub fn spawn(period: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                interval.tick().await;
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
        Self { rx, task: Some(task) }
    }

    /// A ticker driven by hand through the returned [`TickHandle`].
    #[must_use]
    pub fn manual() -> (TickHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TickHandle { tx }, Self { rx, task: None })
    }

    /// Wait for the next tick. `None` once the source is gone.
    pub async fn tick(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Manual tick source for a [`Ticker`].
#[derive(Debug, Clone)]
pub struct TickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl TickHandle {
    /// Emit `n` ticks.
    pub fn tick(&self, n: u64) {
        for _ in 0..n {
            if self.tx.send(()).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_on_deadline_tick_only() {
        let mut wheel = TimeoutWheel::new();
        wheel.schedule(Tick::new(2), "a");

        let mut fired = Vec::new();
        wheel.advance(|id| fired.push(id));
        assert!(fired.is_empty(), "not due yet");

        wheel.advance(|id| fired.push(id));
        assert_eq!(fired, vec!["a"]);
        assert_eq!(wheel.pending(), 0);
    }

    #[test]
    fn test_zero_timeout_fires_next_tick() {
        let mut wheel = TimeoutWheel::new();
        let placed = wheel.schedule(wheel.deadline_after(0), 7_u32);
        assert_eq!(placed, Tick::new(1));

        let mut fired = Vec::new();
        wheel.advance(|id| fired.push(id));
        assert_eq!(fired, vec![7]);
    }

    #[test]
    fn test_same_bucket_fires_together_in_schedule_order() {
        let mut wheel = TimeoutWheel::new();
        wheel.schedule(Tick::new(1), 1_u32);
        wheel.schedule(Tick::new(1), 2);
        wheel.schedule(Tick::new(1), 3);

        let mut fired = Vec::new();
        wheel.advance(|id| fired.push(id));
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn test_catch_up_fires_intermediate_buckets_in_order() {
        let mut wheel = TimeoutWheel::new();
        wheel.schedule(Tick::new(3), "late");
        wheel.schedule(Tick::new(1), "early");
        wheel.schedule(Tick::new(9), "future");

        let mut fired = Vec::new();
        let now = wheel.advance_to(Tick::new(5), |id| fired.push(id));
        assert_eq!(now, Tick::new(5));
        assert_eq!(fired, vec!["early", "late"]);
        assert_eq!(wheel.pending(), 1);
    }

    #[test]
    fn test_deadline_is_relative_to_current_tick() {
        let mut wheel = TimeoutWheel::new();
        wheel.advance_to(Tick::new(10), |_: u8| {});
        assert_eq!(wheel.deadline_after(5), Tick::new(15));
    }

    #[tokio::test]
    async fn test_manual_ticker_delivers_each_tick() {
        let (handle, mut ticker) = Ticker::manual();
        handle.tick(3);
        for _ in 0..3 {
            assert_eq!(ticker.tick().await, Some(()));
        }
        drop(handle);
        assert_eq!(ticker.tick().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_ticker_ticks_per_period() {
        let mut ticker = Ticker::spawn(Duration::from_secs(1));
        let started = Instant::now();
        assert_eq!(ticker.tick().await, Some(()));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
