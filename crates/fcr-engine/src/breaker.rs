//! Count-based sliding-window circuit breaker.
//!
//! The breaker looks at the last `window_size` call outcomes. With a full
//! window and a failure rate at or above the threshold it opens; after
//! `open_duration` it admits exactly one trial call (half-open). A successful
//! trial closes the breaker and clears the window, a failed trial re-opens it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of call outcomes the sliding window holds.
    pub window_size: usize,
    /// Failure rate (0.0..=1.0) that opens the breaker once the window is full.
    pub failure_rate_threshold: f64,
    /// How long the breaker stays open before admitting a trial call.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_rate_threshold: 0.5,
            open_duration: Duration::from_secs(5),
        }
    }
}

struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    failures: usize,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    /// Current FSM state; transitions use compare-and-swap so only one task
    /// moves the breaker out of OPEN.
    state: AtomicU8,
    /// Whether the single half-open trial slot has been claimed.
    trial_taken: AtomicBool,
    window: Mutex<OutcomeWindow>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(STATE_CLOSED),
            trial_taken: AtomicBool::new(false),
            window: Mutex::new(OutcomeWindow {
                outcomes: VecDeque::new(),
                failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Whether a call may proceed right now. In half-open only the first
    /// caller gets through; everyone else is refused until the trial
    /// resolves.
    pub fn try_acquire(&self) -> bool {
        loop {
            match self.state.load(Ordering::SeqCst) {
                STATE_CLOSED => return true,
                STATE_HALF_OPEN => {
                    return self
                        .trial_taken
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok();
                }
                STATE_OPEN => {
                    let elapsed = self.window.lock().opened_at.map(|t| t.elapsed());
                    let Some(elapsed) = elapsed else { return false };
                    if elapsed < self.config.open_duration {
                        return false;
                    }
                    // Open period is over; race to half-open and retry the
                    // loop so the winner claims the trial slot.
                    if self
                        .state
                        .compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        self.trial_taken.store(false, Ordering::SeqCst);
                        debug!("circuit breaker half-open, admitting one trial call");
                    }
                }
                _ => return true,
            }
        }
    }

    pub fn record_success(&self) {
        match self.state.load(Ordering::SeqCst) {
            STATE_HALF_OPEN => {
                let mut window = self.window.lock();
                window.outcomes.clear();
                window.failures = 0;
                window.opened_at = None;
                self.state.store(STATE_CLOSED, Ordering::SeqCst);
                info!("circuit breaker closed after successful trial");
            }
            STATE_CLOSED => self.push_outcome(true),
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state.load(Ordering::SeqCst) {
            STATE_HALF_OPEN => {
                self.window.lock().opened_at = Some(Instant::now());
                self.state.store(STATE_OPEN, Ordering::SeqCst);
                warn!("circuit breaker re-opened, trial call failed");
            }
            STATE_CLOSED => self.push_outcome(false),
            _ => {}
        }
    }

    fn push_outcome(&self, success: bool) {
        let mut window = self.window.lock();

        window.outcomes.push_back(success);
        if !success {
            window.failures += 1;
        }
        while window.outcomes.len() > self.config.window_size {
            if let Some(evicted) = window.outcomes.pop_front() {
                if !evicted {
                    window.failures -= 1;
                }
            }
        }

        let full = window.outcomes.len() >= self.config.window_size;
        let rate = window.failures as f64 / window.outcomes.len() as f64;
        if full && rate >= self.config.failure_rate_threshold {
            window.outcomes.clear();
            window.failures = 0;
            window.opened_at = Some(Instant::now());
            self.state.store(STATE_OPEN, Ordering::SeqCst);
            warn!(
                failure_rate = rate,
                window = self.config.window_size,
                "circuit breaker opened"
            );
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
