//! Reconnect backoff with a circuit breaker

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Reconnect timing for a tunnel session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Failures before the breaker opens
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_consecutive_failures: default_max_consecutive_failures(),
            circuit_breaker_cooldown_ms: default_cooldown_ms(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_cooldown_ms() -> u64 {
    300_000
}

/// Backoff state for one reconnect loop
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    consecutive_failures: u32,
    current_delay_ms: u64,
    open_until: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current_delay_ms = policy.initial_delay_ms;
        Self {
            policy,
            consecutive_failures: 0,
            current_delay_ms,
            open_until: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next attempt, including any breaker cooldown
    pub fn next_delay(&mut self) -> Duration {
        if let Some(until) = self.open_until.take() {
            let remaining = until.saturating_duration_since(Instant::now());
            info!(
                remaining_secs = remaining.as_secs(),
                "Tunnel circuit breaker open, waiting for cooldown"
            );
            self.consecutive_failures = 0;
            self.current_delay_ms = self.policy.initial_delay_ms;
            return remaining;
        }

        let base = Duration::from_millis(self.current_delay_ms);
        let delay = base + Duration::from_millis(jitter_ms(base));

        let next = (self.current_delay_ms as f64 * self.policy.backoff_multiplier) as u64;
        self.current_delay_ms = next.min(self.policy.max_delay_ms);

        delay
    }

    /// Count a failed attempt, opening the breaker when the budget is spent
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.policy.max_consecutive_failures {
            let cooldown = Duration::from_millis(self.policy.circuit_breaker_cooldown_ms);
            self.open_until = Some(Instant::now() + cooldown);
            error!(
                failures = self.consecutive_failures,
                cooldown_secs = cooldown.as_secs(),
                "Tunnel circuit breaker tripped, pausing reconnection attempts"
            );
        }
    }
}

/// Up to 20% of the base delay
fn jitter_ms(base: Duration) -> u64 {
    let range = (base.as_millis() as u64) / 5;
    if range == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as u64) % (range + 1)
}
