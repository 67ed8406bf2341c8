//! Boundary towards the telemetry transport.

use crate::command::WsCommand;
use crate::types::{EntityData, PageData};
use serde::{Deserialize, Serialize};

/// Reply to an entity data command: a full page or incremental updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDataUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PageData<EntityData>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Vec<EntityData>>,
}

impl EntityDataUpdate {
    pub fn snapshot(page: PageData<EntityData>) -> Self {
        Self {
            data: Some(page),
            update: None,
        }
    }

    pub fn update(update: Vec<EntityData>) -> Self {
        Self {
            data: None,
            update: Some(update),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountUpdate {
    pub count: u64,
}

/// Event delivered by the transport to one subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    EntityData(EntityDataUpdate),
    EntityCount(CountUpdate),
    AlarmCount(CountUpdate),
    /// The connection was re-established. Active commands must be resent.
    Reconnect,
}

/// Command channel owned by exactly one subscription.
pub trait TelemetrySubscriber: Send {
    /// Registers and sends the initial commands.
    fn subscribe(&mut self, commands: Vec<WsCommand>);

    /// Replaces the active commands and sends them.
    fn update(&mut self, commands: Vec<WsCommand>);

    /// Cancels all active commands. The subscriber is not reused afterwards.
    fn unsubscribe(&mut self);

    /// Client/server clock offset applied to incoming timestamps.
    fn set_ts_offset(&mut self, ts_offset: i64);
}
