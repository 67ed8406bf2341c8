//! Data model shared by the subscription core and the transport.
//!
//! Wire types mirror the platform's WebSocket API: camelCase fields and
//! SCREAMING_SNAKE enum values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Entity id used for synthetic rows (function and count datasources).
pub const NULL_UUID: &str = "13814000-1dd2-11b2-8080-808080808080";

/// Origin of a widget's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DatasourceType {
    Entity,
    Function,
    EntityCount,
    AlarmCount,
}

impl DatasourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasourceType::Entity => "entity",
            DatasourceType::Function => "function",
            DatasourceType::EntityCount => "entityCount",
            DatasourceType::AlarmCount => "alarmCount",
        }
    }

    /// Datasources whose keys are correlated across entities by name.
    pub fn is_entity_like(&self) -> bool {
        matches!(
            self,
            DatasourceType::Entity | DatasourceType::EntityCount | DatasourceType::AlarmCount
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WidgetType {
    Timeseries,
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataKeyType {
    Timeseries,
    Attribute,
    Function,
    EntityField,
    Count,
}

impl DataKeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKeyType::Timeseries => "timeseries",
            DataKeyType::Attribute => "attribute",
            DataKeyType::Function => "function",
            DataKeyType::EntityField => "entityField",
            DataKeyType::Count => "count",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKeyType {
    Attribute,
    ClientAttribute,
    SharedAttribute,
    ServerAttribute,
    TimeSeries,
    EntityField,
    AlarmField,
    Constant,
    Count,
}

impl EntityKeyType {
    pub fn to_data_key_type(self) -> DataKeyType {
        match self {
            EntityKeyType::Attribute
            | EntityKeyType::ClientAttribute
            | EntityKeyType::SharedAttribute
            | EntityKeyType::ServerAttribute
            | EntityKeyType::Constant => DataKeyType::Attribute,
            EntityKeyType::TimeSeries => DataKeyType::Timeseries,
            EntityKeyType::EntityField | EntityKeyType::AlarmField => DataKeyType::EntityField,
            EntityKeyType::Count => DataKeyType::Count,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationType {
    Min,
    Max,
    Avg,
    Sum,
    Count,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonResultType {
    #[default]
    PreviousValue,
    DeltaAbsolute,
    DeltaPercent,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityId {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: None,
        }
    }
}

/// A single timestamped value as delivered by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TsValue {
    pub ts: i64,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl TsValue {
    pub fn new(ts: i64, value: impl Into<Value>) -> Self {
        Self {
            ts,
            value: value.into(),
            count: None,
        }
    }
}

/// Aggregated value with an optional value from the comparison window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonTsValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<TsValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<TsValue>,
}

/// Per-entity payload of a snapshot or an incremental update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityData {
    pub entity_id: EntityId,
    #[serde(default)]
    pub latest: BTreeMap<EntityKeyType, BTreeMap<String, TsValue>>,
    #[serde(default)]
    pub timeseries: BTreeMap<String, Vec<TsValue>>,
    /// Aggregated channel, keyed by the data key's request position.
    #[serde(default)]
    pub agg_latest: BTreeMap<usize, ComparisonTsValue>,
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new(NULL_UUID)
    }
}

impl EntityData {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            ..Default::default()
        }
    }

    pub fn with_latest(
        mut self,
        key_type: EntityKeyType,
        name: impl Into<String>,
        value: TsValue,
    ) -> Self {
        self.latest
            .entry(key_type)
            .or_default()
            .insert(name.into(), value);
        self
    }

    pub fn with_timeseries(mut self, name: impl Into<String>, values: Vec<TsValue>) -> Self {
        self.timeseries.insert(name.into(), values);
        self
    }

    pub fn with_agg_latest(mut self, key_index: usize, value: ComparisonTsValue) -> Self {
        self.agg_latest.insert(key_index, value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageData<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub total_pages: usize,
    #[serde(default)]
    pub total_elements: usize,
    #[serde(default)]
    pub has_next: bool,
}

impl<T> PageData<T> {
    /// A complete, single-page result.
    pub fn single_page(data: Vec<T>) -> Self {
        let total_elements = data.len();
        Self {
            data,
            total_pages: 1,
            total_elements,
            has_next: false,
        }
    }
}

impl PageData<EntityData> {
    /// Whether `other` lists a different ordered set of entities.
    pub fn membership_differs(&self, other: &PageData<EntityData>) -> bool {
        self.data.len() != other.data.len()
            || self
                .data
                .iter()
                .zip(other.data.iter())
                .any(|(a, b)| a.entity_id.id != b.entity_id.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDataPageLink {
    pub page_size: usize,
    pub page: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<Value>,
    #[serde(default)]
    pub dynamic: bool,
}

/// One processed or original sample: `[timestamp, value, metadata?]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub ts: i64,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl DataPoint {
    pub fn new(ts: i64, value: impl Into<Value>) -> Self {
        Self {
            ts,
            value: value.into(),
            meta: None,
        }
    }

    /// Placeholder used when a key has no previous sample.
    pub(crate) fn origin() -> Self {
        Self::new(0, 0)
    }
}

impl From<&TsValue> for DataPoint {
    fn from(value: &TsValue) -> Self {
        DataPoint::new(value.ts, value.value.clone())
    }
}

/// Timestamp-ascending series for one key of one entity.
pub type DataSet = Vec<DataPoint>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSetHolder {
    pub data: DataSet,
}

/// Raw series grouped by key name.
pub type SubscriptionData = BTreeMap<String, DataSet>;

pub(crate) fn latest_to_subscription_data(values: &BTreeMap<String, TsValue>) -> SubscriptionData {
    values
        .iter()
        .map(|(name, value)| (name.clone(), vec![DataPoint::from(value)]))
        .collect()
}

pub(crate) fn timeseries_to_subscription_data(
    values: &BTreeMap<String, Vec<TsValue>>,
) -> SubscriptionData {
    values
        .iter()
        .map(|(name, series)| (name.clone(), series.iter().map(DataPoint::from).collect()))
        .collect()
}
