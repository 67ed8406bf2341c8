//! Per-entity, per-key buffers and the value pipeline applied to every
//! landed sample.

use crate::key_registry::{KeyRegistry, SubscriptionDataKey};
use crate::listener::DataSink;
use crate::script::PostArgs;
use crate::types::{
    ComparisonResultType, ComparisonTsValue, DataPoint, DataSet, DataSetHolder, DataKeyType,
    EntityData, PageData, SubscriptionData,
};
use crate::value::{as_number, convert_value, number_value};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// How a batch of samples lands in a key's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyMode {
    /// Time series. `replace` drops the previous buffer (aggregator output,
    /// which always carries the whole window, and raw realtime batches);
    /// otherwise samples are appended.
    Series { replace: bool },
    /// Exactly one current sample.
    Latest,
}

#[derive(Debug, Clone, Default)]
struct KeySlot {
    data: DataSetHolder,
    /// Pre-transform samples of the last batch.
    orig: DataSet,
}

#[derive(Debug, Default)]
pub(crate) struct Reconciler {
    page_data: Option<PageData<EntityData>>,
    entity_index: HashMap<String, usize>,
    buffers: Vec<Vec<KeySlot>>,
    premature: Vec<Vec<EntityData>>,
}

impl Reconciler {
    pub(crate) fn page_data(&self) -> Option<&PageData<EntityData>> {
        self.page_data.as_ref()
    }

    pub(crate) fn has_snapshot(&self) -> bool {
        self.page_data.is_some()
    }

    pub(crate) fn store_page(&mut self, page: PageData<EntityData>) {
        self.page_data = Some(page);
    }

    pub(crate) fn take_page(&mut self) -> Option<PageData<EntityData>> {
        self.page_data.take()
    }

    /// Rebuilds the entity index and empties every buffer.
    pub(crate) fn reset_buffers(&mut self, page: &PageData<EntityData>, key_count: usize) {
        self.entity_index = page
            .data
            .iter()
            .enumerate()
            .map(|(index, entity)| (entity.entity_id.id.clone(), index))
            .collect();
        self.buffers = vec![vec![KeySlot::default(); key_count]; page.data.len()];
    }

    pub(crate) fn entity_index(&self, entity_id: &str) -> Option<usize> {
        self.entity_index.get(entity_id).copied()
    }

    pub(crate) fn entity_count(&self) -> usize {
        self.buffers.len()
    }

    /// Holds an update that arrived before the first snapshot.
    pub(crate) fn buffer_premature(&mut self, update: Vec<EntityData>) {
        self.premature.push(update);
    }

    pub(crate) fn take_premature(&mut self) -> Vec<Vec<EntityData>> {
        std::mem::take(&mut self.premature)
    }

    pub(crate) fn last_point(&self, entity: usize, key_index: usize) -> Option<&DataPoint> {
        self.buffers
            .get(entity)
            .and_then(|keys| keys.get(key_index))
            .and_then(|slot| slot.data.data.last())
    }

    pub(crate) fn clear(&mut self) {
        self.page_data = None;
        self.entity_index.clear();
        self.buffers.clear();
        self.premature.clear();
    }

    /// Routes named series to every key registered under the name.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn apply_named(
        &mut self,
        registry: &KeyRegistry,
        data: &SubscriptionData,
        key_type: DataKeyType,
        latest: bool,
        entity: usize,
        mode: ApplyMode,
        detect_changes: bool,
        sink: &mut dyn DataSink,
    ) {
        for (name, samples) in data {
            for &key_index in registry.resolve(name, key_type, latest) {
                self.apply(registry, key_index, entity, samples, mode, detect_changes, sink);
            }
        }
    }

    /// Routes the indexed aggregation channel. Comparison keys turn the
    /// current/previous pair into one computed sample.
    pub(crate) fn apply_indexed(
        &mut self,
        registry: &KeyRegistry,
        agg_latest: &BTreeMap<usize, ComparisonTsValue>,
        entity: usize,
        detect_changes: bool,
        sink: &mut dyn DataSink,
    ) {
        for (&key_index, pair) in agg_latest {
            let Some(key) = registry.key(key_index) else {
                debug!(key_index, "Aggregated value for unknown key index");
                continue;
            };
            let sample = if key.comparison_enabled {
                comparison_sample(key.comparison_result_type, pair)
            } else {
                pair.current.as_ref().map(DataPoint::from)
            };
            let samples: DataSet = sample.into_iter().collect();
            self.apply(
                registry,
                key_index,
                entity,
                &samples,
                ApplyMode::Latest,
                detect_changes,
                sink,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn apply(
        &mut self,
        registry: &KeyRegistry,
        key_index: usize,
        entity: usize,
        samples: &[DataPoint],
        mode: ApplyMode,
        detect_changes: bool,
        sink: &mut dyn DataSink,
    ) {
        let Some(key) = registry.key(key_index) else {
            return;
        };
        let Some(slot) = self
            .buffers
            .get_mut(entity)
            .and_then(|keys| keys.get_mut(key_index))
        else {
            return;
        };

        let fresh = mode == ApplyMode::Series { replace: true } || slot.data.data.is_empty();
        let (mut prev, mut prev_orig) = if fresh {
            (DataPoint::origin(), DataPoint::origin())
        } else {
            (
                slot.data.data.last().cloned().unwrap_or_else(DataPoint::origin),
                slot.orig.last().cloned().unwrap_or_else(DataPoint::origin),
            )
        };

        let batch = match mode {
            ApplyMode::Latest => &samples[..samples.len().min(1)],
            ApplyMode::Series { .. } => samples,
        };

        let mut processed = Vec::with_capacity(batch.len());
        let mut orig = Vec::with_capacity(batch.len());
        for sample in batch {
            let value = process_value(key, sample, &prev, &prev_orig);
            let point = DataPoint {
                ts: sample.ts,
                value,
                meta: sample.meta.clone(),
            };
            orig.push(sample.clone());
            prev_orig = sample.clone();
            prev = point.clone();
            processed.push(point);
        }

        slot.orig = orig;
        match mode {
            ApplyMode::Series { replace: false } => slot.data.data.extend(processed),
            _ => slot.data.data = processed,
        }
        sink.deliver(&slot.data, entity, key.index(), detect_changes, key.latest);
    }
}

/// Numeric coercion followed by the key's post-processing function. A
/// failing function leaves the coerced value in place.
fn process_value(
    key: &SubscriptionDataKey,
    sample: &DataPoint,
    prev: &DataPoint,
    prev_orig: &DataPoint,
) -> serde_json::Value {
    let value = convert_value(&sample.value);
    let Some(post_func) = key.post_func.as_ref() else {
        return value;
    };
    let args = PostArgs {
        time: sample.ts,
        value: &value,
        prev_value: &prev.value,
        time_prev: prev_orig.ts,
        prev_orig_value: &prev_orig.value,
    };
    match post_func(&args) {
        Ok(result) => result,
        Err(e) => {
            debug!(key = %key.name, ts = sample.ts, error = %e, "Post-processing function failed");
            value
        }
    }
}

/// Percent delta is defined as 100 when the previous value is zero.
pub fn comparison_value(result_type: ComparisonResultType, current: f64, previous: f64) -> f64 {
    match result_type {
        ComparisonResultType::PreviousValue => previous,
        ComparisonResultType::DeltaAbsolute => current - previous,
        ComparisonResultType::DeltaPercent => {
            if previous == 0.0 {
                100.0
            } else {
                (current - previous) / previous * 100.0
            }
        }
    }
}

/// Comparison result stamped with the previous period's timestamp. Missing
/// or non-numeric operands yield no sample.
fn comparison_sample(result_type: ComparisonResultType, pair: &ComparisonTsValue) -> Option<DataPoint> {
    let previous = pair.previous.as_ref()?;
    if result_type == ComparisonResultType::PreviousValue {
        return Some(DataPoint::new(previous.ts, convert_value(&previous.value)));
    }
    let current = as_number(&pair.current.as_ref()?.value)?;
    let value = comparison_value(result_type, current, as_number(&previous.value)?);
    Some(DataPoint::new(previous.ts, number_value(value)))
}
