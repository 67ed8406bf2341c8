//! Client-side time-bucketed aggregation of raw samples.
//!
//! One aggregator serves one entity. It keeps a rolling window
//! `(start_ts, end_ts]` that advances by whole intervals as monotonic time
//! elapses, and recomputes its output on its own timer. Each recompute
//! returns an [`AggregatorEmission`]. The caller decides where it goes, so
//! the first emission for a snapshot can be routed differently from steady
//! state ticks without swapping callbacks.

use crate::timewindow::SubscriptionTimewindow;
use crate::types::{AggregationType, DataPoint, DataSet, SubscriptionData};
use crate::value::{as_number, number_value};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Output of one recompute.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorEmission {
    pub data: SubscriptionData,
    pub detect_changes: bool,
}

#[derive(Debug, Clone)]
enum Bucket {
    /// Sample kept as delivered (no aggregation).
    Raw(Value),
    Aggregate { count: f64, sum: f64, value: f64 },
}

impl Bucket {
    fn output(&self) -> Value {
        match self {
            Bucket::Raw(value) => value.clone(),
            Bucket::Aggregate { value, .. } => number_value(*value),
        }
    }
}

#[derive(Debug)]
pub struct DataAggregator {
    agg_type: AggregationType,
    start_ts: i64,
    end_ts: i64,
    time_window: i64,
    interval: i64,
    limit: usize,
    state_data: bool,
    min_period: i64,
    period: i64,

    elapsed: i64,
    interval_scheduled_time: i64,
    data_received: bool,
    reset_pending: bool,
    deadline: Option<i64>,

    buckets: BTreeMap<String, BTreeMap<i64, Bucket>>,
    last_prev: HashMap<String, (i64, Value)>,
    data: Option<SubscriptionData>,
}

impl DataAggregator {
    /// `min_period` bounds how often the aggregator recomputes.
    pub fn new(timewindow: &SubscriptionTimewindow, min_period: i64, now: i64) -> Self {
        let aggregation = &timewindow.aggregation;
        let interval = aggregation.interval.max(1);
        Self {
            agg_type: aggregation.agg_type,
            start_ts: timewindow.start_ts,
            end_ts: timewindow.start_ts + aggregation.time_window,
            time_window: aggregation.time_window,
            interval,
            limit: aggregation.limit,
            state_data: aggregation.state_data,
            min_period,
            period: interval.max(min_period),
            elapsed: 0,
            interval_scheduled_time: now,
            data_received: false,
            reset_pending: false,
            deadline: None,
            buckets: BTreeMap::new(),
            last_prev: HashMap::new(),
            data: None,
        }
    }

    /// Current window bounds.
    pub fn window(&self) -> (i64, i64) {
        (self.start_ts, self.end_ts)
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.deadline
    }

    /// Feeds samples. `update` marks raw samples that must be bucketed;
    /// otherwise the first batch is taken as already aggregated by the
    /// server. Returns an emission when a recompute happened immediately.
    pub fn on_data(
        &mut self,
        data: &SubscriptionData,
        update: bool,
        history: bool,
        detect_changes: bool,
        now: i64,
    ) -> Option<AggregatorEmission> {
        if !self.data_received || self.reset_pending {
            let mut reschedule = true;
            if !self.data_received {
                self.elapsed = 0;
                self.data_received = true;
                self.end_ts = self.start_ts + self.time_window;
            }
            if self.reset_pending {
                self.reset_pending = false;
                reschedule = false;
            }
            self.buckets.clear();
            if update {
                self.bucket_samples(data);
            } else {
                self.load_aggregated(data);
            }
            if reschedule {
                self.interval_scheduled_time = now;
            }
            return Some(self.on_interval(history, detect_changes, now));
        }

        self.bucket_samples(data);
        if history {
            self.interval_scheduled_time = now;
            return Some(self.on_interval(true, detect_changes, now));
        }
        None
    }

    /// Recomputes if the timer is due.
    pub fn on_timer(&mut self, now: i64) -> Option<AggregatorEmission> {
        match self.deadline {
            Some(deadline) if deadline <= now => Some(self.on_interval(false, false, now)),
            _ => None,
        }
    }

    /// Moves the window after a realtime resubscribe. Buckets are replaced
    /// by the next batch of data.
    pub fn reset(&mut self, start_ts: i64, time_window: i64, interval: i64, now: i64) {
        self.interval_scheduled_time = now;
        self.start_ts = start_ts;
        self.time_window = time_window;
        self.interval = interval.max(1);
        self.end_ts = start_ts + time_window;
        self.elapsed = 0;
        self.period = self.interval.max(self.min_period);
        self.reset_pending = true;
        self.data = None;
        self.deadline = Some(now + self.period);
    }

    pub fn destroy(&mut self) {
        self.deadline = None;
        self.buckets.clear();
        self.last_prev.clear();
        self.data = None;
    }

    fn on_interval(&mut self, history: bool, detect_changes: bool, now: i64) -> AggregatorEmission {
        self.elapsed += now - self.interval_scheduled_time;
        self.interval_scheduled_time = now;
        self.deadline = None;

        if history {
            self.data = Some(self.recompute());
        } else {
            let delta = self.elapsed.div_euclid(self.interval);
            if delta > 0 || self.data.is_none() {
                self.start_ts += delta * self.interval;
                self.end_ts += delta * self.interval;
                self.data = Some(self.recompute());
                self.elapsed -= delta * self.interval;
            }
            self.deadline = Some(now + self.period);
        }

        AggregatorEmission {
            data: self.data.clone().unwrap_or_default(),
            detect_changes,
        }
    }

    fn recompute(&mut self) -> SubscriptionData {
        let mut output = SubscriptionData::new();
        for (key, buckets) in self.buckets.iter_mut() {
            let stale: Vec<i64> = buckets
                .range(..=self.start_ts)
                .map(|(ts, _)| *ts)
                .collect();
            for ts in stale {
                let Some(bucket) = buckets.remove(&ts) else {
                    continue;
                };
                if self.state_data
                    && self.last_prev.get(key).map_or(true, |(prev_ts, _)| *prev_ts < ts)
                {
                    self.last_prev.insert(key.clone(), (ts, bucket.output()));
                }
            }

            let mut series: DataSet = buckets
                .range(..=self.end_ts)
                .map(|(ts, bucket)| DataPoint::new(*ts, bucket.output()))
                .collect();
            if self.state_data {
                apply_state_bounds(
                    &mut series,
                    self.last_prev.get(key),
                    self.start_ts,
                    self.end_ts,
                );
            }
            if series.len() > self.limit {
                series.drain(..series.len() - self.limit);
            }
            output.insert(key.clone(), series);
        }
        output
    }

    fn sample_value(&self, raw: &Value) -> Option<Value> {
        if self.agg_type == AggregationType::None {
            return Some(match raw {
                Value::String(text) => text
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
                    .map(number_value)
                    .unwrap_or_else(|| raw.clone()),
                _ => raw.clone(),
            });
        }
        as_number(raw).map(Value::from)
    }

    /// First batch of server-aggregated samples, kept at their timestamps.
    fn load_aggregated(&mut self, data: &SubscriptionData) {
        let is_count = self.agg_type == AggregationType::Count;
        for (key, samples) in data {
            let mut buckets = BTreeMap::new();
            for sample in samples {
                let Some(value) = self.sample_value(&sample.value) else {
                    debug!(key = %key, ts = sample.ts, "Skipping non-numeric aggregated sample");
                    continue;
                };
                let bucket = match value.as_f64() {
                    Some(number) if self.agg_type != AggregationType::None => Bucket::Aggregate {
                        count: if is_count { number } else { 1.0 },
                        sum: number,
                        value: number,
                    },
                    _ => Bucket::Raw(value),
                };
                buckets.insert(sample.ts, bucket);
            }
            self.buckets.insert(key.clone(), buckets);
        }
    }

    fn bucket_timestamp(&self, ts: i64) -> i64 {
        if self.agg_type == AggregationType::None {
            ts
        } else {
            self.start_ts
                + (ts - self.start_ts).div_euclid(self.interval) * self.interval
                + self.interval / 2
        }
    }

    fn bucket_samples(&mut self, data: &SubscriptionData) {
        for (key, samples) in data {
            for sample in samples {
                let Some(value) = self.sample_value(&sample.value) else {
                    debug!(key = %key, ts = sample.ts, "Skipping non-numeric sample");
                    continue;
                };
                let bucket_ts = self.bucket_timestamp(sample.ts);
                let agg_type = self.agg_type;
                let buckets = self.buckets.entry(key.clone()).or_default();
                let number = match (agg_type, value.as_f64()) {
                    (AggregationType::None, _) | (_, None) => {
                        buckets.insert(bucket_ts, Bucket::Raw(value));
                        continue;
                    }
                    (_, Some(number)) => number,
                };
                match buckets.get_mut(&bucket_ts) {
                    Some(Bucket::Aggregate {
                        count,
                        sum,
                        value: current,
                    }) => match agg_type {
                        AggregationType::Avg => {
                            *count += 1.0;
                            *sum += number;
                            *current = *sum / *count;
                        }
                        AggregationType::Min => *current = current.min(number),
                        AggregationType::Max => *current = current.max(number),
                        AggregationType::Sum => *current += number,
                        AggregationType::Count => *current += 1.0,
                        AggregationType::None => {}
                    },
                    _ => {
                        let initial = if agg_type == AggregationType::Count {
                            1.0
                        } else {
                            number
                        };
                        buckets.insert(
                            bucket_ts,
                            Bucket::Aggregate {
                                count: 1.0,
                                sum: number,
                                value: initial,
                            },
                        );
                    }
                }
            }
        }
    }
}

/// Carries the last value from before the window to `start_ts` and extends
/// the last value to `end_ts`.
fn apply_state_bounds(
    series: &mut DataSet,
    last_prev: Option<&(i64, Value)>,
    start_ts: i64,
    end_ts: i64,
) {
    let carried = last_prev.map(|(_, value)| DataPoint::new(start_ts, value.clone()));
    match (series.first(), carried) {
        (None, Some(point)) => series.push(point),
        (Some(first), Some(point)) if first.ts > start_ts => series.insert(0, point),
        _ => {}
    }
    if let Some(last) = series.last() {
        if last.ts < end_ts {
            let mut extended = last.clone();
            extended.ts = end_ts;
            series.push(extended);
        }
    }
}
