//! Wire-level subscription commands and the builder that derives them from
//! the key registry and the active time window.

use crate::key_registry::KeyRegistry;
use crate::timewindow::{comparison_window, is_floating, IntervalType, SubscriptionTimewindow};
use crate::types::{
    AggregationType, ComparisonResultType, DataKeyType, EntityDataPageLink, EntityKeyType,
    WidgetType,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_CMD_ID: AtomicU32 = AtomicU32::new(1);

/// Process-wide unique command id.
pub fn next_cmd_id() -> u32 {
    NEXT_CMD_ID.fetch_add(1, Ordering::Relaxed)
}

/// Entity fields every entity subscription requests.
const DEFAULT_ENTITY_FIELDS: [&str; 3] = ["name", "label", "additionalInfo"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityKey {
    #[serde(rename = "type")]
    pub key_type: EntityKeyType,
    pub key: String,
}

impl EntityKey {
    pub fn new(key_type: EntityKeyType, key: impl Into<String>) -> Self {
        Self {
            key_type,
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDataQuery {
    pub entity_filter: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_link: Option<EntityDataPageLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_filters: Vec<Value>,
    pub entity_fields: Vec<EntityKey>,
    pub latest_values: Vec<EntityKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCountQuery {
    pub entity_filter: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_filters: Vec<Value>,
}

/// Alarm selection of an alarm-count datasource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmCountFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub severity_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_list: Vec<String>,
    #[serde(default)]
    pub search_propagated_alarms: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmCountQuery {
    pub entity_filter: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_filters: Vec<Value>,
    #[serde(flatten)]
    pub alarm_filter: AlarmCountFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestValueCmd {
    pub keys: Vec<EntityKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityHistoryCmd {
    pub keys: Vec<String>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub interval_type: IntervalType,
    pub interval: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone_id: Option<String>,
    pub limit: usize,
    pub agg: AggregationType,
    pub fetch_latest_previous_point: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesCmd {
    pub keys: Vec<String>,
    pub start_ts: i64,
    pub time_window: i64,
    pub interval_type: IntervalType,
    pub interval: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone_id: Option<String>,
    pub limit: usize,
    pub agg: AggregationType,
    pub fetch_latest_previous_point: bool,
}

/// Aggregated key. `id` is the key's request index and comes back as the
/// index of the `aggLatest` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggKey {
    pub id: usize,
    pub key: String,
    pub agg: AggregationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_start_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_end_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value_only: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggEntityHistoryCmd {
    pub keys: Vec<AggKey>,
    pub start_ts: i64,
    pub end_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggTimeSeriesCmd {
    pub keys: Vec<AggKey>,
    pub start_ts: i64,
    pub time_window: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDataCmd {
    pub cmd_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<EntityDataQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_cmd: Option<EntityHistoryCmd>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_cmd: Option<LatestValueCmd>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_cmd: Option<TimeSeriesCmd>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg_history_cmd: Option<AggEntityHistoryCmd>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg_ts_cmd: Option<AggTimeSeriesCmd>,
}

impl EntityDataCmd {
    pub fn new(cmd_id: u32) -> Self {
        Self {
            cmd_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_none()
            && self.history_cmd.is_none()
            && self.latest_cmd.is_none()
            && self.ts_cmd.is_none()
            && self.agg_history_cmd.is_none()
            && self.agg_ts_cmd.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCountCmd {
    pub cmd_id: u32,
    pub query: EntityCountQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmCountCmd {
    pub cmd_id: u32,
    pub query: AlarmCountQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeCmd {
    pub cmd_id: u32,
}

/// Command pushed onto the telemetry transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsCommand {
    EntityData(EntityDataCmd),
    EntityCount(EntityCountCmd),
    AlarmCount(AlarmCountCmd),
    EntityDataUnsubscribe(UnsubscribeCmd),
    EntityCountUnsubscribe(UnsubscribeCmd),
    AlarmCountUnsubscribe(UnsubscribeCmd),
}

impl WsCommand {
    pub fn cmd_id(&self) -> u32 {
        match self {
            WsCommand::EntityData(cmd) => cmd.cmd_id,
            WsCommand::EntityCount(cmd) => cmd.cmd_id,
            WsCommand::AlarmCount(cmd) => cmd.cmd_id,
            WsCommand::EntityDataUnsubscribe(cmd)
            | WsCommand::EntityCountUnsubscribe(cmd)
            | WsCommand::AlarmCountUnsubscribe(cmd) => cmd.cmd_id,
        }
    }

    /// Matching unsubscribe command, `None` for unsubscribe commands.
    pub fn unsubscribe(&self) -> Option<WsCommand> {
        let cmd = UnsubscribeCmd {
            cmd_id: self.cmd_id(),
        };
        match self {
            WsCommand::EntityData(_) => Some(WsCommand::EntityDataUnsubscribe(cmd)),
            WsCommand::EntityCount(_) => Some(WsCommand::EntityCountUnsubscribe(cmd)),
            WsCommand::AlarmCount(_) => Some(WsCommand::AlarmCountUnsubscribe(cmd)),
            _ => None,
        }
    }
}

/// `keyFilters` followed by `additionalKeyFilters`.
pub fn merge_key_filters(key_filters: &[Value], additional: &[Value]) -> Vec<Value> {
    key_filters.iter().chain(additional).cloned().collect()
}

fn push_unique(keys: &mut Vec<EntityKey>, key: EntityKey) {
    if !keys.contains(&key) {
        keys.push(key);
    }
}

/// Key lists split by channel, derived once from the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyFields {
    pub entity_fields: Vec<EntityKey>,
    pub attr_fields: Vec<EntityKey>,
    /// Raw (non-aggregated, non-latest) time series.
    pub ts_fields: Vec<EntityKey>,
    pub latest_values: Vec<EntityKey>,
    /// Request indices of aggregated keys without comparison.
    pub agg_ts_values: Vec<usize>,
    /// Request indices of aggregated keys with comparison.
    pub agg_ts_comparison_values: Vec<usize>,
}

impl KeyFields {
    pub fn from_registry(registry: &KeyRegistry) -> Self {
        let mut fields = KeyFields::default();
        let timeseries_widget = registry.widget_type() == WidgetType::Timeseries;
        let mut latest_ts = Vec::new();

        for key in registry.keys() {
            match key.key_type {
                DataKeyType::EntityField => push_unique(
                    &mut fields.entity_fields,
                    EntityKey::new(EntityKeyType::EntityField, key.name.clone()),
                ),
                DataKeyType::Attribute => push_unique(
                    &mut fields.attr_fields,
                    EntityKey::new(EntityKeyType::Attribute, key.name.clone()),
                ),
                DataKeyType::Timeseries if key.is_aggregated() => {
                    if key.comparison_enabled {
                        fields.agg_ts_comparison_values.push(key.index());
                    } else {
                        fields.agg_ts_values.push(key.index());
                    }
                }
                DataKeyType::Timeseries => {
                    let entity_key = EntityKey::new(EntityKeyType::TimeSeries, key.name.clone());
                    if key.latest || !timeseries_widget {
                        push_unique(&mut latest_ts, entity_key);
                    } else {
                        push_unique(&mut fields.ts_fields, entity_key);
                    }
                }
                DataKeyType::Function | DataKeyType::Count => {}
            }
        }

        for name in DEFAULT_ENTITY_FIELDS {
            push_unique(
                &mut fields.entity_fields,
                EntityKey::new(EntityKeyType::EntityField, name),
            );
        }

        fields.latest_values = fields.attr_fields.clone();
        fields.latest_values.extend(latest_ts);

        let aggregated: Vec<&str> = fields
            .agg_ts_values
            .iter()
            .chain(&fields.agg_ts_comparison_values)
            .filter_map(|index| registry.key(*index))
            .map(|key| key.name.as_str())
            .collect();
        fields.latest_values.retain(|entity_key| {
            entity_key.key_type != EntityKeyType::TimeSeries
                || !aggregated.contains(&entity_key.key.as_str())
        });

        fields
    }

    pub fn has_aggregation(&self) -> bool {
        !self.agg_ts_values.is_empty() || !self.agg_ts_comparison_values.is_empty()
    }

    /// Aggregated keys, comparison keys annotated with their shifted window.
    pub fn agg_keys(
        &self,
        registry: &KeyRegistry,
        timewindow: &SubscriptionTimewindow,
    ) -> Vec<AggKey> {
        let plain = self.agg_ts_values.iter().filter_map(|i| registry.key(*i)).map(|key| AggKey {
            id: key.index(),
            key: key.name.clone(),
            agg: key.agg_type.unwrap_or_default(),
            previous_start_ts: None,
            previous_end_ts: None,
            previous_value_only: None,
        });
        let comparison = self
            .agg_ts_comparison_values
            .iter()
            .filter_map(|i| registry.key(*i))
            .map(|key| {
                let window = comparison_window(
                    timewindow,
                    key.time_for_comparison,
                    key.comparison_custom_interval_value,
                );
                AggKey {
                    id: key.index(),
                    key: key.name.clone(),
                    agg: key.agg_type.unwrap_or_default(),
                    previous_start_ts: Some(window.start_time_ms),
                    previous_end_ts: Some(window.end_time_ms),
                    previous_value_only: Some(
                        key.comparison_result_type == ComparisonResultType::PreviousValue,
                    ),
                }
            });
        plain.chain(comparison).collect()
    }

    pub fn entity_data_query(
        &self,
        entity_filter: Value,
        page_link: Option<EntityDataPageLink>,
        key_filters: Vec<Value>,
    ) -> EntityDataQuery {
        EntityDataQuery {
            entity_filter,
            page_link,
            key_filters,
            entity_fields: self.entity_fields.clone(),
            latest_values: self.latest_values.clone(),
        }
    }
}

/// Attaches the history/realtime, latest and aggregated sub-commands to
/// `cmd`. Aggregation is skipped on floating windows.
pub fn prepare_subscription_commands(
    cmd: &mut EntityDataCmd,
    fields: &KeyFields,
    registry: &KeyRegistry,
    timewindow: Option<&SubscriptionTimewindow>,
) {
    if let Some(tw) = timewindow {
        if registry.widget_type() == WidgetType::Timeseries && !fields.ts_fields.is_empty() {
            let keys: Vec<String> = fields.ts_fields.iter().map(|k| k.key.clone()).collect();
            let aggregation = &tw.aggregation;
            match tw.fixed_window {
                Some(fixed) => {
                    cmd.history_cmd = Some(EntityHistoryCmd {
                        keys,
                        start_ts: fixed.start_time_ms,
                        end_ts: fixed.end_time_ms,
                        interval_type: aggregation.interval_type,
                        interval: aggregation.interval,
                        time_zone_id: tw.timezone.clone(),
                        limit: aggregation.limit,
                        agg: aggregation.agg_type,
                        fetch_latest_previous_point: aggregation.state_data,
                    });
                }
                None => {
                    cmd.ts_cmd = Some(TimeSeriesCmd {
                        keys,
                        start_ts: tw.start_ts,
                        time_window: aggregation.time_window,
                        interval_type: aggregation.interval_type,
                        interval: aggregation.interval,
                        time_zone_id: tw.timezone.clone(),
                        limit: aggregation.limit,
                        agg: aggregation.agg_type,
                        fetch_latest_previous_point: aggregation.state_data,
                    });
                }
            }
        }
    }

    if !fields.latest_values.is_empty() {
        cmd.latest_cmd = Some(LatestValueCmd {
            keys: fields.latest_values.clone(),
        });
    }

    if !fields.has_aggregation() || is_floating(timewindow) {
        return;
    }
    if let Some(tw) = timewindow {
        let keys = fields.agg_keys(registry, tw);
        match tw.fixed_window {
            Some(fixed) => {
                cmd.agg_history_cmd = Some(AggEntityHistoryCmd {
                    keys,
                    start_ts: fixed.start_time_ms,
                    end_ts: fixed.end_time_ms,
                });
            }
            None => {
                cmd.agg_ts_cmd = Some(AggTimeSeriesCmd {
                    keys,
                    start_ts: tw.start_ts,
                    time_window: tw.aggregation.time_window,
                });
            }
        }
    }
}
