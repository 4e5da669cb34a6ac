//! Back-off delay policies driving recovery retries.

use std::fmt::Debug;
use std::time::Duration;

/// What to do before the next recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Wait(Duration),
    /// The policy is exhausted; recovery must give up.
    Terminate,
}

/// Maps an attempt number (starting at 1) to a delay.
pub trait BackOffDelayPolicy: Send + Sync + Debug {
    fn delay(&self, attempt: u32) -> Delay;
}

/// First attempt waits `initial_delay`, every following attempt waits
/// `delay`. With a timeout, attempts whose cumulative wait would exceed it
/// terminate instead.
#[derive(Debug, Clone)]
pub struct FixedWithInitialDelay {
    initial_delay: Duration,
    delay: Duration,
    timeout: Option<Duration>,
}

impl FixedWithInitialDelay {
    pub fn new(initial_delay: Duration, delay: Duration) -> Self {
        FixedWithInitialDelay {
            initial_delay,
            delay,
            timeout: None,
        }
    }

    pub fn with_timeout(initial_delay: Duration, delay: Duration, timeout: Duration) -> Self {
        FixedWithInitialDelay {
            initial_delay,
            delay,
            timeout: Some(timeout),
        }
    }

    fn elapsed_through(&self, attempt: u32) -> Duration {
        self.initial_delay + self.delay * attempt.saturating_sub(1)
    }
}

impl BackOffDelayPolicy for FixedWithInitialDelay {
    fn delay(&self, attempt: u32) -> Delay {
        if let Some(timeout) = self.timeout {
            if self.elapsed_through(attempt) > timeout {
                return Delay::Terminate;
            }
        }
        if attempt <= 1 {
            Delay::Wait(self.initial_delay)
        } else {
            Delay::Wait(self.delay)
        }
    }
}
