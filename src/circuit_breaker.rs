// Gate for the notification webhook, which is hit once per booking write. While
// the receiver is down a tripped breaker drops notifications at the call site,
// so no request is spawned and no timeout is paid until the cool-down ends and
// a trial delivery succeeds.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    open_duration: Duration,
    state: State,
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { successes: u32 },
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            open_duration,
            state: State::Closed { failures: 0 },
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    // Moves Open -> HalfOpen once the cool-down has elapsed
    pub fn should_allow_call(&mut self) -> bool {
        match self.state {
            State::Closed { .. } | State::HalfOpen { .. } => true,
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.open_duration {
                    self.state = State::HalfOpen { successes: 0 };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn success(&mut self) {
        match &mut self.state {
            State::Closed { failures } => *failures = 0,
            State::HalfOpen { successes } => {
                *successes += 1;
                if *successes >= self.success_threshold {
                    self.state = State::Closed { failures: 0 };
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn fail(&mut self) {
        match &mut self.state {
            State::Closed { failures } => {
                *failures += 1;
                if *failures >= self.failure_threshold {
                    self.trip();
                }
            }
            State::HalfOpen { .. } => self.trip(),
            State::Open { .. } => {}
        }
    }

    fn trip(&mut self) {
        self.state = State::Open {
            opened_at: Instant::now(),
        };
    }
}
