//! Process-wide admission control for outbound model calls.
//!
//! Every agent shares one [`RequestPacer`]. Acquisition is two-phase:
//!
//! 1. **Queue**: poll until the in-flight count is below the (live)
//!    capacity, then take a slot.
//! 2. **Reserve**: compute the earliest permitted start as
//!    `max(now, next_start_at, cooldown_until) + jitter`, publish
//!    `start + min_start_interval` for the next caller, and sleep until then.
//!
//! The slot is owned by the returned [`PacerPermit`] and released when the
//! permit drops, so every exit path (success, error, cancellation of the
//! acquiring future) gives it back exactly once.
//!
//! The lock is a plain `std::sync::Mutex` and is never held across an
//! `.await`, which keeps the pacer safe to share between independent tokio
//! runtimes on different OS threads. Slot waiting polls at
//! `wait_poll_interval` rather than using a wakeup primitive; capacity is
//! re-read from [`LiveTuning`] on every poll.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::LiveTuning;

/// Pacer tunables. Re-read on every acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct PacerTuning {
    pub max_inflight: usize,
    pub min_start_interval: Duration,
    pub start_jitter: Duration,
    pub rate_limit_cooldown: Duration,
    pub rate_limit_cooldown_max: Duration,
    pub wait_poll_interval: Duration,
}

impl Default for PacerTuning {
    fn default() -> Self {
        Self {
            max_inflight: 2,
            min_start_interval: Duration::from_millis(700),
            start_jitter: Duration::from_millis(250),
            rate_limit_cooldown: Duration::from_secs(20),
            rate_limit_cooldown_max: Duration::from_secs(180),
            wait_poll_interval: Duration::from_secs(1),
        }
    }
}

impl PacerTuning {
    /// Clamp values to their working minimums.
    pub fn sanitized(mut self) -> Self {
        self.max_inflight = self.max_inflight.max(1);
        self.rate_limit_cooldown_max = self.rate_limit_cooldown_max.max(Duration::from_secs(1));
        self.wait_poll_interval = self.wait_poll_interval.max(Duration::from_millis(100));
        self
    }
}

/// Why an acquiring caller is currently waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    /// No in-flight slot available, or spacing behind the previous start.
    Queue,
    /// Held back by a rate-limit cooldown.
    Cooldown,
}

impl WaitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitPhase::Queue => "queue",
            WaitPhase::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Default)]
struct PacerState {
    inflight: usize,
    capacity: usize,
    next_start_at: Option<Instant>,
    cooldown_until: Option<Instant>,
}

/// Point-in-time view of the pacer, for logs and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct PacerSnapshot {
    pub inflight: usize,
    pub capacity: usize,
    pub cooldown_remaining: Option<Duration>,
}

#[derive(Debug)]
pub struct RequestPacer {
    state: Mutex<PacerState>,
    tuning: LiveTuning<PacerTuning>,
}

impl RequestPacer {
    pub fn new(tuning: LiveTuning<PacerTuning>) -> Self {
        let capacity = tuning.get().sanitized().max_inflight;
        Self {
            state: Mutex::new(PacerState {
                capacity,
                ..Default::default()
            }),
            tuning,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PacerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn tuning(&self) -> PacerTuning {
        self.tuning.get().sanitized()
    }

    /// Wait for an admitted slot and a paced start time.
    ///
    /// `on_wait` is invoked with the phase and elapsed wait each time the
    /// caller has to back off.
    pub async fn acquire<F>(&self, mut on_wait: F) -> PacerPermit<'_>
    where
        F: FnMut(WaitPhase, Duration),
    {
        let waiting_since = Instant::now();

        // Phase one: slot.
        loop {
            let tuning = self.tuning();
            {
                let mut state = self.lock();
                state.capacity = tuning.max_inflight;
                if state.inflight < state.capacity {
                    state.inflight += 1;
                    break;
                }
            }
            on_wait(WaitPhase::Queue, waiting_since.elapsed());
            tokio::time::sleep(tuning.wait_poll_interval).await;
        }
        let permit = PacerPermit { pacer: self };

        // Phase two: reservation.
        let tuning = self.tuning();
        let (delay, phase) = {
            let mut state = self.lock();
            let now = Instant::now();
            let mut start = now;
            if let Some(next) = state.next_start_at {
                start = start.max(next);
            }
            let mut phase = WaitPhase::Queue;
            if let Some(cooldown) = state.cooldown_until.filter(|c| *c > start) {
                start = cooldown;
                phase = WaitPhase::Cooldown;
            }
            start += random_jitter(tuning.start_jitter);
            state.next_start_at = Some(start + tuning.min_start_interval);
            (start.saturating_duration_since(now), phase)
        };

        if !delay.is_zero() {
            on_wait(phase, waiting_since.elapsed());
            tokio::time::sleep(delay).await;
        }
        permit
    }

    /// Extend the process-wide cooldown after a provider rate-limit signal.
    pub fn register_rate_limit(&self, retry_after: Option<Duration>) {
        let tuning = self.tuning();
        let suggested = retry_after
            .filter(|d| !d.is_zero())
            .unwrap_or(tuning.rate_limit_cooldown);
        let delay = suggested.min(tuning.rate_limit_cooldown_max);
        let until = Instant::now() + delay;

        let mut state = self.lock();
        state.cooldown_until = Some(match state.cooldown_until {
            Some(existing) => existing.max(until),
            None => until,
        });
        tracing::warn!(cooldown_secs = delay.as_secs_f64(), "Rate limit reported, pacer cooling down");
    }

    pub fn snapshot(&self) -> PacerSnapshot {
        let state = self.lock();
        PacerSnapshot {
            inflight: state.inflight,
            capacity: state.capacity,
            cooldown_remaining: state
                .cooldown_until
                .map(|until| until.saturating_duration_since(Instant::now()))
                .filter(|d| !d.is_zero()),
        }
    }

    fn release(&self) {
        let mut state = self.lock();
        state.inflight = state.inflight.saturating_sub(1);
    }
}

fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = max.as_millis().min(u64::MAX as u128) as u64;
    Duration::from_millis(rand::rng().random_range(0..=millis))
}

/// An admitted in-flight slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct PacerPermit<'a> {
    pacer: &'a RequestPacer,
}

impl Drop for PacerPermit<'_> {
    fn drop(&mut self) {
        self.pacer.release();
    }
}
