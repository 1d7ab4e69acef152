use std::time::Duration;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential { factor: u32, max: Duration },
}

/// Reconnect schedule for the live channel. The default never gives up and never
/// grows: the console is a long-lived operator session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub backoff: Backoff,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            backoff: Backoff::Fixed,
            max_attempts: None,
        }
    }

    pub fn exponential(initial: Duration, factor: u32, max: Duration) -> Self {
        Self {
            delay: initial,
            backoff: Backoff::Exponential {
                factor: factor.max(1),
                max,
            },
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before retry number `attempt` (1-based, reset after every successful
    /// open). `None` means the policy is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if attempt > max_attempts {
                return None;
            }
        }
        match self.backoff {
            Backoff::Fixed => Some(self.delay),
            Backoff::Exponential { factor, max } => {
                let mut delay = self.delay.min(max);
                if factor <= 1 || delay.is_zero() {
                    return Some(delay);
                }
                for _ in 1..attempt {
                    delay = delay.saturating_mul(factor);
                    if delay >= max {
                        return Some(max);
                    }
                }
                Some(delay)
            }
        }
    }
}
