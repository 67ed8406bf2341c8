//! Active time range of a subscription and comparison window arithmetic.

use crate::types::AggregationType;
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

/// Bucket size of an aggregated request: a literal millisecond width or a
/// calendar unit resolved by the server in the window's timezone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalType {
    #[default]
    Milliseconds,
    Week,
    WeekIso,
    Month,
    Quarter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedWindow {
    pub start_time_ms: i64,
    pub end_time_ms: i64,
}

impl FixedWindow {
    pub fn new(start_time_ms: i64, end_time_ms: i64) -> Self {
        Self {
            start_time_ms,
            end_time_ms,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_time_ms - self.start_time_ms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationParams {
    pub interval: i64,
    #[serde(default)]
    pub interval_type: IntervalType,
    pub limit: usize,
    #[serde(rename = "type")]
    pub agg_type: AggregationType,
    pub time_window: i64,
    #[serde(default)]
    pub state_data: bool,
}

impl Default for AggregationParams {
    fn default() -> Self {
        Self {
            interval: 1_000,
            interval_type: IntervalType::Milliseconds,
            limit: 200,
            agg_type: AggregationType::None,
            time_window: 60_000,
            state_data: false,
        }
    }
}

/// Resolved time window handed to a subscription by its owner.
///
/// History mode is signalled by `fixed_window`, realtime mode by
/// `realtime_window_ms`. `ts_offset` is the client/server clock offset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionTimewindow {
    pub start_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quick_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime_window_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_window: Option<FixedWindow>,
    #[serde(default)]
    pub aggregation: AggregationParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub ts_offset: i64,
}

impl SubscriptionTimewindow {
    /// Rolling window of `window_ms` starting at `start_ts`.
    pub fn realtime(start_ts: i64, window_ms: i64, aggregation: AggregationParams) -> Self {
        Self {
            start_ts,
            realtime_window_ms: Some(window_ms),
            aggregation: AggregationParams {
                time_window: window_ms,
                ..aggregation
            },
            ..Default::default()
        }
    }

    pub fn history(window: FixedWindow, aggregation: AggregationParams) -> Self {
        Self {
            start_ts: window.start_time_ms,
            fixed_window: Some(window),
            aggregation: AggregationParams {
                time_window: window.duration_ms(),
                ..aggregation
            },
            ..Default::default()
        }
    }

    pub fn with_quick_interval(mut self, quick_interval: impl Into<String>) -> Self {
        self.quick_interval = Some(quick_interval.into());
        self
    }

    pub fn with_ts_offset(mut self, ts_offset: i64) -> Self {
        self.ts_offset = ts_offset;
        self
    }

    pub fn is_history(&self) -> bool {
        self.fixed_window.is_some()
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime_window_ms.is_some()
    }

    /// Realtime window with no quick-interval preset. Its bounds cannot be
    /// expressed as a stable server-side aggregation request.
    pub fn is_floating(&self) -> bool {
        !self.is_history() && self.quick_interval.is_none()
    }

    /// Bounds the comparison window is derived from.
    fn base_window(&self) -> FixedWindow {
        self.fixed_window.unwrap_or_else(|| {
            FixedWindow::new(
                self.start_ts,
                self.start_ts + self.realtime_window_ms.unwrap_or(self.aggregation.time_window),
            )
        })
    }
}

/// A window with no timewindow at all is treated as floating.
pub fn is_floating(timewindow: Option<&SubscriptionTimewindow>) -> bool {
    timewindow.map_or(true, SubscriptionTimewindow::is_floating)
}

/// How far back the comparison window of an aggregated key is shifted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonDuration {
    #[default]
    PreviousInterval,
    Days,
    Weeks,
    Months,
    Years,
    CustomInterval,
}

/// Shifted window used by comparison-enabled aggregated keys. Fixed-length
/// durations keep the active window's length. Month and year shifts move
/// both bounds by calendar months, so a whole month compares against the
/// whole previous month.
pub fn comparison_window(
    timewindow: &SubscriptionTimewindow,
    duration: ComparisonDuration,
    custom_interval_ms: Option<i64>,
) -> FixedWindow {
    let base = timewindow.base_window();
    let shift = |offset: i64| {
        FixedWindow::new(base.start_time_ms - offset, base.end_time_ms - offset)
    };
    match duration {
        ComparisonDuration::PreviousInterval => shift(base.duration_ms()),
        ComparisonDuration::Days => shift(86_400_000),
        ComparisonDuration::Weeks => shift(7 * 86_400_000),
        ComparisonDuration::Months => FixedWindow::new(
            shift_months(base.start_time_ms, 1),
            shift_months(base.end_time_ms, 1),
        ),
        ComparisonDuration::Years => FixedWindow::new(
            shift_months(base.start_time_ms, 12),
            shift_months(base.end_time_ms, 12),
        ),
        ComparisonDuration::CustomInterval => match custom_interval_ms {
            Some(interval) if interval > 0 => shift(interval),
            _ => base,
        },
    }
}

/// Moves a UTC timestamp back by whole calendar months, clamping the day to
/// the end of the target month.
fn shift_months(ts_ms: i64, months: u32) -> i64 {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .and_then(|dt| dt.checked_sub_months(Months::new(months)))
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(ts_ms)
}
