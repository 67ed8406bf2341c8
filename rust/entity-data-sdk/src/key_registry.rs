//! Normalized index of the data keys a widget requested.
//!
//! Keys that arrive on the wire by name are grouped under a [`DataKeyId`]
//! built from `(name, type, aggregation bucket, latest)`. Same-id requests
//! form an ordered list and receive increasing `list_index` values.

use crate::script::{PostFunction, ScriptCompiler, ValueFunction};
use crate::timewindow::ComparisonDuration;
use crate::types::{AggregationType, ComparisonResultType, DataKeyType, DatasourceType, WidgetType};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::{debug, warn};

/// One requested signal.
#[derive(Clone)]
pub struct SubscriptionDataKey {
    pub name: String,
    pub key_type: DataKeyType,
    pub agg_type: Option<AggregationType>,
    pub comparison_enabled: bool,
    pub time_for_comparison: ComparisonDuration,
    pub comparison_custom_interval_value: Option<i64>,
    pub comparison_result_type: ComparisonResultType,
    pub func_body: Option<String>,
    pub func: Option<ValueFunction>,
    pub post_func_body: Option<String>,
    pub post_func: Option<PostFunction>,
    /// Requested through the latest-values channel of a time-series widget.
    pub latest: bool,
    pub(crate) index: usize,
    pub(crate) list_index: usize,
    pub(crate) last_update_time: Option<i64>,
}

impl SubscriptionDataKey {
    pub fn new(name: impl Into<String>, key_type: DataKeyType) -> Self {
        Self {
            name: name.into(),
            key_type,
            agg_type: None,
            comparison_enabled: false,
            time_for_comparison: ComparisonDuration::PreviousInterval,
            comparison_custom_interval_value: None,
            comparison_result_type: ComparisonResultType::PreviousValue,
            func_body: None,
            func: None,
            post_func_body: None,
            post_func: None,
            latest: false,
            index: 0,
            list_index: 0,
            last_update_time: None,
        }
    }

    pub fn timeseries(name: impl Into<String>) -> Self {
        Self::new(name, DataKeyType::Timeseries)
    }

    pub fn attribute(name: impl Into<String>) -> Self {
        Self::new(name, DataKeyType::Attribute)
    }

    pub fn entity_field(name: impl Into<String>) -> Self {
        Self::new(name, DataKeyType::EntityField)
    }

    pub fn function(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(name, DataKeyType::Function).with_func_body(body)
    }

    pub fn count(name: impl Into<String>) -> Self {
        Self::new(name, DataKeyType::Count)
    }

    pub fn with_aggregation(mut self, agg_type: AggregationType) -> Self {
        self.agg_type = Some(agg_type);
        self
    }

    pub fn with_comparison(
        mut self,
        time_for_comparison: ComparisonDuration,
        result_type: ComparisonResultType,
    ) -> Self {
        self.comparison_enabled = true;
        self.time_for_comparison = time_for_comparison;
        self.comparison_result_type = result_type;
        self
    }

    pub fn with_custom_comparison_interval(mut self, interval_ms: i64) -> Self {
        self.comparison_custom_interval_value = Some(interval_ms);
        self
    }

    pub fn with_func_body(mut self, body: impl Into<String>) -> Self {
        self.func_body = Some(body.into());
        self
    }

    pub fn with_func(mut self, func: ValueFunction) -> Self {
        self.func = Some(func);
        self
    }

    pub fn with_post_func_body(mut self, body: impl Into<String>) -> Self {
        self.post_func_body = Some(body.into());
        self
    }

    pub fn with_post_func(mut self, post_func: PostFunction) -> Self {
        self.post_func = Some(post_func);
        self
    }

    pub fn with_latest(mut self, latest: bool) -> Self {
        self.latest = latest;
        self
    }

    /// Aggregated keys are delivered through the indexed aggregation channel.
    pub fn is_aggregated(&self) -> bool {
        matches!(self.agg_type, Some(agg) if agg != AggregationType::None)
    }

    /// Position in the original request.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Position among keys sharing the same [`DataKeyId`].
    pub fn list_index(&self) -> usize {
        self.list_index
    }

    /// Timestamp of the last locally generated sample.
    pub fn last_update_time(&self) -> Option<i64> {
        self.last_update_time
    }

    fn descriptor_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.key_type.hash(&mut hasher);
        self.agg_type.hash(&mut hasher);
        self.comparison_enabled.hash(&mut hasher);
        self.time_for_comparison.hash(&mut hasher);
        self.comparison_custom_interval_value.hash(&mut hasher);
        self.comparison_result_type.hash(&mut hasher);
        self.func_body.hash(&mut hasher);
        self.post_func_body.hash(&mut hasher);
        self.latest.hash(&mut hasher);
        self.index.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Debug for SubscriptionDataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionDataKey")
            .field("name", &self.name)
            .field("key_type", &self.key_type)
            .field("agg_type", &self.agg_type)
            .field("comparison_enabled", &self.comparison_enabled)
            .field("latest", &self.latest)
            .field("index", &self.index)
            .field("list_index", &self.list_index)
            .field("has_func", &self.func.is_some())
            .field("has_post_func", &self.post_func.is_some())
            .finish_non_exhaustive()
    }
}

/// Composite identity of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataKeyId {
    /// Correlated by name across entities.
    Named {
        name: String,
        key_type: DataKeyType,
        /// Request index, present only for aggregated keys so a series can be
        /// requested both raw and aggregated under one name.
        agg_index: Option<usize>,
        latest: bool,
    },
    /// Function datasource key in a time-series widget. Input order is its
    /// only identity.
    Function {
        name: String,
        index: usize,
        key_type: DataKeyType,
        latest: bool,
    },
    /// Uncorrelated key, identified by its whole descriptor.
    Descriptor(u64),
}

impl DataKeyId {
    fn for_key(
        key: &SubscriptionDataKey,
        datasource_type: DatasourceType,
        widget_type: WidgetType,
    ) -> Self {
        let correlated =
            datasource_type.is_entity_like() || widget_type == WidgetType::Timeseries;
        if !correlated {
            return DataKeyId::Descriptor(key.descriptor_hash());
        }
        if datasource_type == DatasourceType::Function {
            DataKeyId::Function {
                name: key.name.clone(),
                index: key.index,
                key_type: key.key_type,
                latest: key.latest,
            }
        } else {
            DataKeyId::Named {
                name: key.name.clone(),
                key_type: key.key_type,
                agg_index: key.is_aggregated().then_some(key.index),
                latest: key.latest,
            }
        }
    }

    fn is_grouped(&self) -> bool {
        !matches!(self, DataKeyId::Descriptor(_))
    }
}

impl fmt::Display for DataKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKeyId::Named {
                name,
                key_type,
                agg_index,
                latest,
            } => {
                write!(f, "{}_{}", name, key_type.as_str())?;
                if let Some(index) = agg_index {
                    write!(f, "_{}", index)?;
                }
                if *latest {
                    f.write_str("_latest")?;
                }
                Ok(())
            }
            DataKeyId::Function {
                name,
                index,
                key_type,
                latest,
            } => {
                write!(f, "{}_{}_{}", name, index, key_type.as_str())?;
                if *latest {
                    f.write_str("_latest")?;
                }
                Ok(())
            }
            DataKeyId::Descriptor(hash) => write!(f, "#{:016x}", hash),
        }
    }
}

#[derive(Debug, Clone)]
enum KeyEntry {
    Single(usize),
    List(Vec<usize>),
}

impl KeyEntry {
    fn indices(&self) -> &[usize] {
        match self {
            KeyEntry::Single(index) => std::slice::from_ref(index),
            KeyEntry::List(indices) => indices,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyRegistry {
    datasource_type: DatasourceType,
    widget_type: WidgetType,
    keys: Vec<SubscriptionDataKey>,
    ids: Vec<DataKeyId>,
    order: Vec<DataKeyId>,
    entries: HashMap<DataKeyId, KeyEntry>,
    /// Names under which function keys travel through the aggregator.
    series: HashMap<String, usize>,
}

impl KeyRegistry {
    /// Compiles user function bodies (sequentially, one key at a time) and
    /// indexes the keys. Compile failures leave the key without a function.
    pub async fn build(
        mut keys: Vec<SubscriptionDataKey>,
        datasource_type: DatasourceType,
        widget_type: WidgetType,
        compiler: &dyn ScriptCompiler,
    ) -> Self {
        for key in keys.iter_mut() {
            if datasource_type == DatasourceType::Function {
                if key.func.is_some() {
                    continue;
                }
                if let Some(body) = key.func_body.as_deref() {
                    match compiler.compile_value_function(body).await {
                        Ok(func) => key.func = Some(func),
                        Err(e) => warn!(key = %key.name, error = %e, "Failed to compile value function"),
                    }
                }
            } else if key.post_func.is_none() {
                if let Some(body) = key.post_func_body.as_deref() {
                    match compiler.compile_post_function(body).await {
                        Ok(func) => key.post_func = Some(func),
                        Err(e) => warn!(key = %key.name, error = %e, "Failed to compile post-processing function"),
                    }
                }
            }
        }
        Self::from_keys(keys, datasource_type, widget_type)
    }

    /// Indexes already compiled keys.
    pub fn from_keys(
        keys: Vec<SubscriptionDataKey>,
        datasource_type: DatasourceType,
        widget_type: WidgetType,
    ) -> Self {
        let mut registry = Self {
            datasource_type,
            widget_type,
            keys: Vec::with_capacity(keys.len()),
            ids: Vec::with_capacity(keys.len()),
            order: Vec::new(),
            entries: HashMap::new(),
            series: HashMap::new(),
        };

        for (index, mut key) in keys.into_iter().enumerate() {
            key.index = index;
            let id = DataKeyId::for_key(&key, datasource_type, widget_type);

            if id.is_grouped() {
                let entry = registry.entries.entry(id.clone()).or_insert_with(|| {
                    registry.order.push(id.clone());
                    KeyEntry::List(Vec::new())
                });
                if let KeyEntry::List(list) = entry {
                    key.list_index = list.len();
                    list.push(index);
                }
            } else {
                registry.order.push(id.clone());
                registry.entries.insert(id.clone(), KeyEntry::Single(index));
            }

            if datasource_type == DatasourceType::Function
                && widget_type == WidgetType::Timeseries
                && !key.latest
            {
                registry.series.insert(series_name(&key), index);
            }

            debug!(key = %id, index, list_index = key.list_index, "Registered data key");
            registry.keys.push(key);
            registry.ids.push(id);
        }

        registry
    }

    pub fn datasource_type(&self) -> DatasourceType {
        self.datasource_type
    }

    pub fn widget_type(&self) -> WidgetType {
        self.widget_type
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in request order.
    pub fn keys(&self) -> &[SubscriptionDataKey] {
        &self.keys
    }

    pub fn key(&self, index: usize) -> Option<&SubscriptionDataKey> {
        self.keys.get(index)
    }

    pub(crate) fn key_mut(&mut self, index: usize) -> Option<&mut SubscriptionDataKey> {
        self.keys.get_mut(index)
    }

    pub fn id(&self, index: usize) -> Option<&DataKeyId> {
        self.ids.get(index)
    }

    /// Entry ids in first-registration order.
    pub fn ids(&self) -> &[DataKeyId] {
        &self.order
    }

    /// Request indices registered under `id`, ordered by `list_index`.
    pub fn lookup(&self, id: &DataKeyId) -> &[usize] {
        self.entries.get(id).map(KeyEntry::indices).unwrap_or(&[])
    }

    /// Request indices for a series arriving by name.
    ///
    /// Function datasources publish aggregator output as `{name}_{index}`.
    pub fn resolve(&self, name: &str, key_type: DataKeyType, latest: bool) -> &[usize] {
        if self.datasource_type == DatasourceType::Function {
            return self
                .series
                .get(name)
                .map(std::slice::from_ref)
                .unwrap_or(&[]);
        }
        self.lookup(&DataKeyId::Named {
            name: name.to_string(),
            key_type,
            agg_index: None,
            latest,
        })
    }

    /// Request indices of function keys generated as series, in request
    /// order.
    pub(crate) fn function_series(&self) -> Vec<usize> {
        self.keys
            .iter()
            .filter(|key| self.series.get(&series_name(key)) == Some(&key.index))
            .map(|key| key.index)
            .collect()
    }
}

pub(crate) fn series_name(key: &SubscriptionDataKey) -> String {
    format!("{}_{}", key.name, key.index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptError;
    use crate::script::{ExpressionCompiler, PostArgs};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn entity_keys() -> Vec<SubscriptionDataKey> {
        vec![
            SubscriptionDataKey::timeseries("temperature"),
            SubscriptionDataKey::timeseries("temperature").with_aggregation(AggregationType::Avg),
            SubscriptionDataKey::timeseries("temperature").with_latest(true),
            SubscriptionDataKey::timeseries("temperature"),
            SubscriptionDataKey::attribute("temperature"),
            SubscriptionDataKey::timeseries("temperature").with_aggregation(AggregationType::None),
        ]
    }

    #[test]
    fn test_duplicate_keys_get_increasing_list_index() {
        let registry = KeyRegistry::from_keys(
            entity_keys(),
            DatasourceType::Entity,
            WidgetType::Timeseries,
        );

        let raw = DataKeyId::Named {
            name: "temperature".to_string(),
            key_type: DataKeyType::Timeseries,
            agg_index: None,
            latest: false,
        };
        assert_eq!(registry.lookup(&raw), &[0, 3, 5]);
        let list_indices: Vec<usize> = registry
            .lookup(&raw)
            .iter()
            .map(|i| registry.key(*i).unwrap().list_index())
            .collect();
        assert_eq!(list_indices, vec![0, 1, 2]);

        assert_eq!(registry.id(1).unwrap().to_string(), "temperature_timeseries_1");
        assert_eq!(registry.id(2).unwrap().to_string(), "temperature_timeseries_latest");
        assert_eq!(registry.id(4).unwrap().to_string(), "temperature_attribute");
        assert_eq!(registry.ids().len(), 4);
    }

    #[test]
    fn test_distinguishable_keys_get_distinct_ids() {
        let registry = KeyRegistry::from_keys(
            entity_keys(),
            DatasourceType::Entity,
            WidgetType::Timeseries,
        );
        let distinct: HashSet<&DataKeyId> = registry.ids().iter().collect();
        assert_eq!(distinct.len(), registry.ids().len());
        for (index, key) in registry.keys().iter().enumerate() {
            assert_eq!(key.index(), index);
        }
    }

    #[test]
    fn test_function_keys_embed_index() {
        let keys = vec![
            SubscriptionDataKey::function("sin", "Math.sin(time)"),
            SubscriptionDataKey::function("sin", "Math.cos(time)"),
        ];
        let registry =
            KeyRegistry::from_keys(keys, DatasourceType::Function, WidgetType::Timeseries);

        assert_eq!(registry.id(0).unwrap().to_string(), "sin_0_function");
        assert_eq!(registry.id(1).unwrap().to_string(), "sin_1_function");
        assert_eq!(registry.resolve("sin_1", DataKeyType::Function, false), &[1]);
        assert_eq!(registry.function_series(), vec![0, 1]);
    }

    #[test]
    fn test_latest_widget_function_keys_use_descriptor() {
        let keys = vec![
            SubscriptionDataKey::function("a", "1"),
            SubscriptionDataKey::function("a", "1"),
        ];
        let registry = KeyRegistry::from_keys(keys, DatasourceType::Function, WidgetType::Latest);

        assert!(matches!(registry.id(0), Some(DataKeyId::Descriptor(_))));
        assert_ne!(registry.id(0), registry.id(1));
        assert_eq!(registry.lookup(registry.id(1).unwrap()), &[1]);
        assert_eq!(registry.key(1).unwrap().list_index(), 0);
    }

    #[tokio::test]
    async fn test_build_compiles_and_tolerates_bad_scripts() {
        let keys = vec![
            SubscriptionDataKey::timeseries("temperature").with_post_func_body("value * 2"),
            SubscriptionDataKey::timeseries("humidity").with_post_func_body("value *"),
            SubscriptionDataKey::timeseries("pressure").with_post_func(Arc::new(|_: &PostArgs<'_>| {
                Err(ScriptError::Runtime("native".to_string()))
            })),
        ];
        let registry = KeyRegistry::build(
            keys,
            DatasourceType::Entity,
            WidgetType::Timeseries,
            &ExpressionCompiler::new(),
        )
        .await;

        assert!(registry.key(0).unwrap().post_func.is_some());
        assert!(registry.key(1).unwrap().post_func.is_none());
        assert!(registry.key(2).unwrap().post_func.is_some());
        assert_eq!(registry.len(), 3);
    }
}
