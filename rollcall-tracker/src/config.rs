//! Tracker configuration

use std::time::Duration;

use crate::error::TrackerError;

/// Tunable timing and naming for one tracker server.
///
/// `down_period` defaults to `broadcast_period × max_silent_periods × 2`,
/// two missed forced-heartbeat windows, unless set explicitly.
#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub server_name: String,
    pub broadcast_period: Duration,
    pub max_silent_periods: u32,
    down_period: Option<Duration>,
    pub permdown_period: Duration,
    pub clock_sample_periods: u32,
}

impl TrackerConfig {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            broadcast_period: Duration::from_millis(1500),
            max_silent_periods: 10,
            down_period: None,
            permdown_period: Duration::from_millis(1_200_000),
            clock_sample_periods: 2,
        }
    }

    pub fn with_broadcast_period(mut self, period: Duration) -> Self {
        self.broadcast_period = period;
        self
    }

    pub fn with_max_silent_periods(mut self, periods: u32) -> Self {
        self.max_silent_periods = periods;
        self
    }

    pub fn with_down_period(mut self, period: Duration) -> Self {
        self.down_period = Some(period);
        self
    }

    pub fn with_permdown_period(mut self, period: Duration) -> Self {
        self.permdown_period = period;
        self
    }

    pub fn with_clock_sample_periods(mut self, periods: u32) -> Self {
        self.clock_sample_periods = periods;
        self
    }

    /// Silence before a peer is flagged down.
    pub fn down_period(&self) -> Duration {
        self.down_period
            .unwrap_or(self.broadcast_period * self.max_silent_periods * 2)
    }

    /// The namespaced transport topic this tracker subscribes to.
    pub fn topic(&self) -> String {
        format!("phx_presence:{}", self.server_name)
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.broadcast_period.is_zero() {
            return Err(TrackerError::Config(
                "broadcast_period must be positive".into(),
            ));
        }
        if self.max_silent_periods == 0 {
            return Err(TrackerError::Config(
                "max_silent_periods must be at least 1".into(),
            ));
        }
        if self.clock_sample_periods == 0 {
            return Err(TrackerError::Config(
                "clock_sample_periods must be at least 1".into(),
            ));
        }
        if self.down_period() >= self.permdown_period {
            return Err(TrackerError::Config(
                "down_period must be shorter than permdown_period".into(),
            ));
        }
        Ok(())
    }
}
