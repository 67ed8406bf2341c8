use std::time::Duration;

/// Upper bound for the function datasource tick period in time-series mode.
pub const DEFAULT_MAX_TICK_FREQUENCY_MS: u64 = 5_000;
/// Tick period used for locally generated latest values.
pub const DEFAULT_LATEST_TICK_FREQUENCY_MS: u64 = 1_000;
/// Lower bound for the aggregator recompute period.
pub const DEFAULT_MIN_AGGREGATION_PERIOD_MS: u64 = 1_000;

/// Scheduler tunables for a single entity data subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub max_tick_frequency: Duration,
    pub latest_tick_frequency: Duration,
    pub min_aggregation_period: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_tick_frequency: Duration::from_millis(DEFAULT_MAX_TICK_FREQUENCY_MS),
            latest_tick_frequency: Duration::from_millis(DEFAULT_LATEST_TICK_FREQUENCY_MS),
            min_aggregation_period: Duration::from_millis(DEFAULT_MIN_AGGREGATION_PERIOD_MS),
        }
    }
}

impl SubscriptionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tick_frequency(mut self, frequency: Duration) -> Self {
        self.max_tick_frequency = frequency;
        self
    }

    pub fn with_latest_tick_frequency(mut self, frequency: Duration) -> Self {
        self.latest_tick_frequency = frequency;
        self
    }

    pub fn with_min_aggregation_period(mut self, period: Duration) -> Self {
        self.min_aggregation_period = period;
        self
    }

    pub(crate) fn max_tick_ms(&self) -> i64 {
        self.max_tick_frequency.as_millis().max(1) as i64
    }

    pub(crate) fn latest_tick_ms(&self) -> i64 {
        self.latest_tick_frequency.as_millis().max(1) as i64
    }

    pub(crate) fn min_aggregation_ms(&self) -> i64 {
        self.min_aggregation_period.as_millis() as i64
    }
}

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub auto_reconnect: bool,
    pub reconnect_intervals: Vec<Duration>,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_intervals: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ],
            max_reconnect_attempts: 5,
            ping_interval: Duration::from_secs(15),
        }
    }
}

impl ConnectionConfig {
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Backoff delay for the given attempt, repeating the last interval once
    /// the list is exhausted.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_intervals
            .get(attempt as usize)
            .copied()
            .unwrap_or_else(|| {
                self.reconnect_intervals
                    .last()
                    .copied()
                    .unwrap_or(Duration::from_secs(16))
            })
    }
}
