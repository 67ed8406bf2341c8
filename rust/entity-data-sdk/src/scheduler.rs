//! Tick clocks and sample generation for function datasources.

use crate::key_registry::SubscriptionDataKey;
use crate::timewindow::SubscriptionTimewindow;
use crate::types::{AggregationType, DataPoint, DataSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One periodic clock with elapsed-time accounting.
#[derive(Debug, Clone)]
pub(crate) struct TickClock {
    frequency: i64,
    scheduled_time: i64,
    elapsed: i64,
    deadline: Option<i64>,
}

impl TickClock {
    /// The first tick is due immediately.
    pub(crate) fn new(frequency: i64, now: i64) -> Self {
        Self {
            frequency: frequency.max(1),
            scheduled_time: now,
            elapsed: 0,
            deadline: Some(now),
        }
    }

    pub(crate) fn frequency(&self) -> i64 {
        self.frequency
    }

    pub(crate) fn deadline(&self) -> Option<i64> {
        self.deadline
    }

    pub(crate) fn is_due(&self, now: i64) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Consumes whole periods elapsed since the previous tick and carries
    /// the remainder forward.
    pub(crate) fn tick(&mut self, now: i64) -> i64 {
        self.deadline = None;
        self.elapsed += now - self.scheduled_time;
        self.scheduled_time = now;
        let delta = self.elapsed.div_euclid(self.frequency);
        self.elapsed -= delta * self.frequency;
        delta
    }

    pub(crate) fn rearm(&mut self, now: i64) {
        self.deadline = Some(now + self.frequency);
    }
}

/// The two independent clocks of a function datasource.
#[derive(Debug, Default)]
pub(crate) struct FunctionScheduler {
    pub(crate) series: Option<TickClock>,
    pub(crate) latest: Option<TickClock>,
}

impl FunctionScheduler {
    pub(crate) fn next_deadline(&self) -> Option<i64> {
        [&self.series, &self.latest]
            .into_iter()
            .filter_map(|clock| clock.as_ref().and_then(TickClock::deadline))
            .min()
    }

    pub(crate) fn pending(&self) -> usize {
        [&self.series, &self.latest]
            .into_iter()
            .filter(|clock| clock.as_ref().is_some_and(|c| c.deadline().is_some()))
            .count()
    }

    pub(crate) fn stop(&mut self) {
        self.series = None;
        self.latest = None;
    }
}

/// Series period: the aggregation interval capped at `max_tick`.
pub(crate) fn series_frequency(timewindow: &SubscriptionTimewindow, max_tick: i64) -> i64 {
    timewindow.aggregation.interval.min(max_tick).max(1)
}

/// Generation range of one key for a realtime tick.
pub(crate) fn realtime_range(
    key: &SubscriptionDataKey,
    timewindow: &SubscriptionTimewindow,
    frequency: i64,
    delta_elapsed: i64,
    wall_now: i64,
) -> (i64, i64) {
    let (start, mut end) = match key.last_update_time() {
        Some(last) => (last + frequency, last + delta_elapsed),
        None => {
            let start = timewindow.start_ts;
            let window = timewindow
                .realtime_window_ms
                .unwrap_or(timewindow.aggregation.time_window);
            let end = start + window + frequency;
            if timewindow.aggregation.agg_type == AggregationType::None {
                let limit = i64::try_from(timewindow.aggregation.limit).unwrap_or(i64::MAX);
                (end.saturating_sub(frequency.saturating_mul(limit)).max(start), end)
            } else {
                (start, end)
            }
        }
    };
    if timewindow.quick_interval.is_some() {
        end = end.min(wall_now + timewindow.ts_offset);
    }
    (start, end)
}

/// Fixed window bounds shifted by the client/server offset.
pub(crate) fn history_range(timewindow: &SubscriptionTimewindow) -> Option<(i64, i64)> {
    timewindow.fixed_window.map(|window| {
        (
            window.start_time_ms + timewindow.ts_offset,
            window.end_time_ms + timewindow.ts_offset,
        )
    })
}

/// Runs the key's value function over `[start, end]` every `frequency`
/// ms. Samples whose function fails are skipped. Stops as soon as `cancel`
/// fires.
pub(crate) fn generate_series(
    key: &mut SubscriptionDataKey,
    mut prev: DataPoint,
    start: i64,
    end: i64,
    frequency: i64,
    cancel: &CancellationToken,
) -> DataSet {
    let mut series = DataSet::new();
    let Some(func) = key.func.clone() else {
        return series;
    };
    let mut time = start;
    while time <= end {
        if cancel.is_cancelled() {
            debug!(key = %key.name, "Series generation cancelled");
            break;
        }
        match func(time, &prev.value) {
            Ok(value) => {
                let point = DataPoint::new(time, value);
                series.push(point.clone());
                prev = point;
                key.last_update_time = Some(time);
            }
            Err(e) => debug!(key = %key.name, time, error = %e, "Value function failed"),
        }
        time += frequency;
    }
    series
}

/// Single current sample for a latest key.
pub(crate) fn generate_latest(
    key: &mut SubscriptionDataKey,
    prev: &DataPoint,
    wall_now: i64,
) -> Option<DataPoint> {
    let func = key.func.clone()?;
    match func(wall_now, &prev.value) {
        Ok(value) => {
            key.last_update_time = Some(wall_now);
            Some(DataPoint::new(wall_now, value))
        }
        Err(e) => {
            debug!(key = %key.name, error = %e, "Value function failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptError;
    use crate::script::ValueFunction;
    use crate::timewindow::{AggregationParams, FixedWindow};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn counter_key() -> SubscriptionDataKey {
        let func: ValueFunction = Arc::new(|_time: i64, prev: &Value| {
            Ok(json!(prev.as_i64().unwrap_or(0) + 1))
        });
        SubscriptionDataKey::function("counter", "return prevValue + 1;").with_func(func)
    }

    fn realtime_tw() -> SubscriptionTimewindow {
        SubscriptionTimewindow::realtime(
            0,
            10_000,
            AggregationParams {
                interval: 1_000,
                limit: 3,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_tick_carries_remainder() {
        let mut clock = TickClock::new(1_000, 0);
        assert!(clock.is_due(0));
        assert_eq!(clock.tick(1_500), 1);
        clock.rearm(1_500);
        assert_eq!(clock.deadline(), Some(2_500));
        assert_eq!(clock.tick(2_600), 2);
    }

    #[test]
    fn test_first_realtime_range_respects_limit() {
        let key = counter_key();
        let (start, end) = realtime_range(&key, &realtime_tw(), 1_000, 0, 0);
        assert_eq!(end, 11_000);
        assert_eq!(start, 8_000);
    }

    #[test]
    fn test_huge_limit_starts_at_window_start() {
        let key = counter_key();
        let mut tw = realtime_tw();
        tw.aggregation.limit = usize::MAX;
        assert_eq!(realtime_range(&key, &tw, 1_000, 0, 0), (0, 11_000));
    }

    #[test]
    fn test_realtime_range_continues_from_last_update() {
        let mut key = counter_key();
        key.last_update_time = Some(11_000);
        let (start, end) = realtime_range(&key, &realtime_tw(), 1_000, 2_000, 0);
        assert_eq!((start, end), (12_000, 13_000));
    }

    #[test]
    fn test_quick_interval_clamps_to_now() {
        let key = counter_key();
        let tw = realtime_tw().with_quick_interval("CURRENT_HOUR").with_ts_offset(100);
        let (_, end) = realtime_range(&key, &tw, 1_000, 0, 5_000);
        assert_eq!(end, 5_100);
    }

    #[test]
    fn test_history_range_is_offset() {
        let tw = SubscriptionTimewindow::history(FixedWindow::new(1_000, 2_000), Default::default())
            .with_ts_offset(-10);
        assert_eq!(history_range(&tw), Some((990, 1_990)));
    }

    #[test]
    fn test_generate_series_chains_previous_value() {
        let mut key = counter_key();
        let token = CancellationToken::new();
        let series = generate_series(&mut key, DataPoint::origin(), 0, 2_000, 1_000, &token);
        let values: Vec<Value> = series.iter().map(|p| p.value.clone()).collect();
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(key.last_update_time(), Some(2_000));
    }

    #[test]
    fn test_generate_series_stops_when_cancelled() {
        let mut key = counter_key();
        let token = CancellationToken::new();
        token.cancel();
        assert!(generate_series(&mut key, DataPoint::origin(), 0, 10_000, 1, &token).is_empty());
    }

    #[test]
    fn test_failing_function_skips_samples() {
        let func: ValueFunction =
            Arc::new(|_: i64, _: &Value| Err(ScriptError::Runtime("boom".to_string())));
        let mut key = SubscriptionDataKey::function("broken", "").with_func(func);
        let token = CancellationToken::new();
        assert!(generate_series(&mut key, DataPoint::origin(), 0, 3_000, 1_000, &token).is_empty());
        assert!(generate_latest(&mut key, &DataPoint::origin(), 10).is_none());
        assert_eq!(key.last_update_time(), None);
    }
}
