//! Per-datasource-type behaviour, selected once when a subscription is
//! created.

use crate::command::{
    merge_key_filters, next_cmd_id, prepare_subscription_commands, AlarmCountCmd,
    AlarmCountFilter, AlarmCountQuery, EntityCountCmd, EntityCountQuery, EntityDataCmd, KeyFields,
    WsCommand,
};
use crate::key_registry::KeyRegistry;
use crate::timewindow::SubscriptionTimewindow;
use crate::transport::{CountUpdate, SubscriberEvent};
use crate::types::{
    DatasourceType, EntityData, EntityDataPageLink, EntityId, EntityKeyType, PageData, TsValue,
    NULL_UUID,
};
use serde_json::Value;
use tracing::debug;

/// Inputs shared by every command-building step.
pub(crate) struct CommandContext<'a> {
    pub registry: &'a KeyRegistry,
    pub fields: &'a KeyFields,
    pub timewindow: Option<&'a SubscriptionTimewindow>,
    pub paginated: bool,
}

/// What `subscribe()` does first.
#[derive(Debug)]
pub(crate) enum Opening {
    /// Commands to register on the transport.
    Transport(Vec<WsCommand>),
    /// A locally synthesized snapshot; nothing is sent.
    Synthetic(PageData<EntityData>),
}

/// A transport event translated into reconciler input.
#[derive(Debug)]
pub(crate) enum Inbound {
    Snapshot(PageData<EntityData>),
    Update(Vec<EntityData>),
}

pub(crate) struct EntityQuery {
    pub entity_filter: Value,
    pub page_link: Option<EntityDataPageLink>,
    pub key_filters: Vec<Value>,
    pub additional_key_filters: Vec<Value>,
    pub alarm_filter: Option<AlarmCountFilter>,
}

pub(crate) enum DatasourceHandler {
    Entity(EntityHandler),
    Function,
    Count(CountHandler),
}

impl DatasourceHandler {
    pub(crate) fn new(
        datasource_type: DatasourceType,
        query: EntityQuery,
        ctx: &CommandContext<'_>,
    ) -> Self {
        let key_filters = merge_key_filters(&query.key_filters, &query.additional_key_filters);
        match datasource_type {
            DatasourceType::Entity => DatasourceHandler::Entity(EntityHandler::new(
                query.entity_filter,
                query.page_link,
                key_filters,
                ctx,
            )),
            DatasourceType::Function => DatasourceHandler::Function,
            DatasourceType::EntityCount | DatasourceType::AlarmCount => {
                let key_name = ctx
                    .registry
                    .keys()
                    .first()
                    .map(|key| key.name.clone())
                    .unwrap_or_else(|| "count".to_string());
                let cmd_id = next_cmd_id();
                let command = if datasource_type == DatasourceType::AlarmCount {
                    WsCommand::AlarmCount(AlarmCountCmd {
                        cmd_id,
                        query: AlarmCountQuery {
                            entity_filter: query.entity_filter,
                            key_filters,
                            alarm_filter: query.alarm_filter.unwrap_or_default(),
                        },
                    })
                } else {
                    WsCommand::EntityCount(EntityCountCmd {
                        cmd_id,
                        query: EntityCountQuery {
                            entity_filter: query.entity_filter,
                            key_filters,
                        },
                    })
                };
                DatasourceHandler::Count(CountHandler {
                    kind: datasource_type,
                    key_name,
                    received: false,
                    command,
                })
            }
        }
    }

    pub(crate) fn opening(&self, now_wall: i64) -> Opening {
        match self {
            DatasourceHandler::Entity(handler) => {
                Opening::Transport(vec![WsCommand::EntityData(handler.data_command.clone())])
            }
            DatasourceHandler::Count(handler) => Opening::Transport(vec![handler.command.clone()]),
            DatasourceHandler::Function => {
                let entity = EntityData::new(EntityId {
                    id: NULL_UUID.to_string(),
                    entity_type: Some("DEVICE".to_string()),
                })
                .with_latest(
                    EntityKeyType::EntityField,
                    "name",
                    TsValue::new(now_wall, DatasourceType::Function.as_str()),
                );
                Opening::Synthetic(PageData::single_page(vec![entity]))
            }
        }
    }

    pub(crate) fn on_event(&mut self, event: SubscriberEvent, now_wall: i64) -> Option<Inbound> {
        match (self, event) {
            (DatasourceHandler::Entity(_), SubscriberEvent::EntityData(update)) => {
                match (update.data, update.update) {
                    (Some(page), _) => Some(Inbound::Snapshot(page)),
                    (None, Some(update)) => Some(Inbound::Update(update)),
                    (None, None) => None,
                }
            }
            (DatasourceHandler::Count(handler), SubscriberEvent::EntityCount(count))
                if handler.kind == DatasourceType::EntityCount =>
            {
                Some(handler.on_count(count, now_wall))
            }
            (DatasourceHandler::Count(handler), SubscriberEvent::AlarmCount(count))
                if handler.kind == DatasourceType::AlarmCount =>
            {
                Some(handler.on_count(count, now_wall))
            }
            (_, event) => {
                debug!(?event, "Ignoring event not meant for this datasource");
                None
            }
        }
    }

    /// Commands sent when the owner starts the subscription.
    pub(crate) fn start_commands(&mut self, ctx: &CommandContext<'_>) -> Option<Vec<WsCommand>> {
        match self {
            DatasourceHandler::Entity(handler) => handler.start(ctx),
            _ => None,
        }
    }

    /// Commands to resend after the transport reconnected.
    pub(crate) fn reconnect_commands(
        &mut self,
        ctx: &CommandContext<'_>,
        started: bool,
    ) -> Vec<WsCommand> {
        match self {
            DatasourceHandler::Entity(handler) => handler.reconnect(ctx, started),
            DatasourceHandler::Count(handler) => vec![handler.command.clone()],
            DatasourceHandler::Function => Vec::new(),
        }
    }

    pub(crate) fn uses_transport(&self) -> bool {
        !matches!(self, DatasourceHandler::Function)
    }
}

pub(crate) struct EntityHandler {
    data_command: EntityDataCmd,
    subs_command: Option<EntityDataCmd>,
}

impl EntityHandler {
    fn new(
        entity_filter: Value,
        page_link: Option<EntityDataPageLink>,
        key_filters: Vec<Value>,
        ctx: &CommandContext<'_>,
    ) -> Self {
        let mut data_command = EntityDataCmd::new(next_cmd_id());
        data_command.query = Some(ctx.fields.entity_data_query(entity_filter, page_link, key_filters));
        if ctx.paginated {
            prepare_subscription_commands(&mut data_command, ctx.fields, ctx.registry, ctx.timewindow);
        }
        Self {
            data_command,
            subs_command: None,
        }
    }

    fn start(&mut self, ctx: &CommandContext<'_>) -> Option<Vec<WsCommand>> {
        let mut subs_command = EntityDataCmd::new(self.data_command.cmd_id);
        prepare_subscription_commands(&mut subs_command, ctx.fields, ctx.registry, ctx.timewindow);
        if subs_command.is_empty() {
            return None;
        }
        self.subs_command = Some(subs_command.clone());
        Some(vec![WsCommand::EntityData(subs_command)])
    }

    /// Rebuilds the active command against the (possibly refreshed) window.
    fn reconnect(&mut self, ctx: &CommandContext<'_>, started: bool) -> Vec<WsCommand> {
        if !started {
            return vec![WsCommand::EntityData(self.data_command.clone())];
        }
        let mut target = EntityDataCmd::new(self.data_command.cmd_id);
        prepare_subscription_commands(&mut target, ctx.fields, ctx.registry, ctx.timewindow);
        target.query = self.data_command.query.clone();
        if ctx.paginated {
            self.data_command = target.clone();
        } else {
            self.subs_command = Some(target.clone());
        }
        vec![WsCommand::EntityData(target)]
    }
}

pub(crate) struct CountHandler {
    kind: DatasourceType,
    key_name: String,
    received: bool,
    command: WsCommand,
}

impl CountHandler {
    /// The first count becomes a one-entity snapshot, later counts updates.
    fn on_count(&mut self, count: CountUpdate, now_wall: i64) -> Inbound {
        let entity = EntityData::new(EntityId::default()).with_latest(
            EntityKeyType::Count,
            self.key_name.clone(),
            TsValue::new(now_wall, count.count.to_string()),
        );
        if self.received {
            return Inbound::Update(vec![entity]);
        }
        self.received = true;
        let entity = entity.with_latest(
            EntityKeyType::EntityField,
            "name",
            TsValue::new(now_wall, self.kind.as_str()),
        );
        Inbound::Snapshot(PageData::single_page(vec![entity]))
    }
}
