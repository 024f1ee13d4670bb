use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
}

/// Emergency pause for automatic submissions. Opens after `threshold`
/// consecutive failures; any success closes it. A threshold of 0 disables it.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold,
            opened_at: None,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    /// Returns true when this failure opened the circuit.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        if self.threshold > 0 && self.failures >= self.threshold && self.state == CircuitState::Closed {
            self.state = CircuitState::Open;
            self.opened_at = Some(Utc::now());
            return true;
        }
        false
    }

    pub fn allow(&self) -> bool {
        self.state == CircuitState::Closed
    }
}
