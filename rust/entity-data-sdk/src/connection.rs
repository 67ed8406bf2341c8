//! WebSocket telemetry transport.
//!
//! One connection is shared by many subscriptions. Each subscription gets a
//! [`WsTelemetrySubscriber`] and a receiver of [`SubscriberEvent`]s; replies
//! are routed back by `cmdId`.

use crate::command::WsCommand;
use crate::config::ConnectionConfig;
use crate::error::EntityDataError;
use crate::transport::{CountUpdate, EntityDataUpdate, SubscriberEvent, TelemetrySubscriber};
use crate::types::{EntityData, PageData};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Error,
}

enum ServiceCommand {
    Register {
        id: u64,
        events: mpsc::UnboundedSender<SubscriberEvent>,
    },
    Subscribe {
        id: u64,
        commands: Vec<WsCommand>,
    },
    Update {
        id: u64,
        commands: Vec<WsCommand>,
    },
    Unsubscribe {
        id: u64,
    },
    SetTsOffset {
        id: u64,
        ts_offset: i64,
    },
    Disconnect,
}

/// Outgoing envelope.
#[derive(Debug, Serialize)]
struct CommandEnvelope<'a> {
    cmds: &'a [WsCommand],
}

/// Incoming reply to one command.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandReply {
    cmd_id: u32,
    #[serde(default)]
    data: Option<PageData<EntityData>>,
    #[serde(default)]
    update: Option<Vec<EntityData>>,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    error_code: i32,
    #[serde(default)]
    error_msg: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyKind {
    EntityData,
    EntityCount,
    AlarmCount,
}

impl ReplyKind {
    fn of(command: &WsCommand) -> Option<Self> {
        match command {
            WsCommand::EntityData(_) => Some(ReplyKind::EntityData),
            WsCommand::EntityCount(_) => Some(ReplyKind::EntityCount),
            WsCommand::AlarmCount(_) => Some(ReplyKind::AlarmCount),
            _ => None,
        }
    }
}

struct Route {
    events: mpsc::UnboundedSender<SubscriberEvent>,
    commands: Vec<WsCommand>,
    ts_offset: i64,
}

#[derive(Default)]
struct RouteTable {
    routes: HashMap<u64, Route>,
    by_cmd: HashMap<u32, (u64, ReplyKind)>,
}

impl RouteTable {
    /// Replaces the active commands of `id`; returns the ones to send.
    fn set_commands(&mut self, id: u64, commands: Vec<WsCommand>) -> Vec<WsCommand> {
        let Some(route) = self.routes.get_mut(&id) else {
            debug!(subscriber = id, "Commands for unregistered subscriber");
            return Vec::new();
        };
        for old in &route.commands {
            self.by_cmd.remove(&old.cmd_id());
        }
        for command in &commands {
            if let Some(kind) = ReplyKind::of(command) {
                self.by_cmd.insert(command.cmd_id(), (id, kind));
            }
        }
        route.commands = commands.clone();
        commands
    }

    /// Drops `id` and returns the matching unsubscribe commands.
    fn remove(&mut self, id: u64) -> Vec<WsCommand> {
        let Some(route) = self.routes.remove(&id) else {
            return Vec::new();
        };
        route
            .commands
            .iter()
            .inspect(|command| {
                self.by_cmd.remove(&command.cmd_id());
            })
            .filter_map(WsCommand::unsubscribe)
            .collect()
    }

    fn all_commands(&self) -> Vec<WsCommand> {
        self.routes
            .values()
            .flat_map(|route| route.commands.iter().cloned())
            .collect()
    }

    fn dispatch(&self, reply: CommandReply) {
        let Some(&(id, kind)) = self.by_cmd.get(&reply.cmd_id) else {
            debug!(cmd_id = reply.cmd_id, "Reply for unknown command");
            return;
        };
        if reply.error_code != 0 {
            warn!(
                cmd_id = reply.cmd_id,
                code = reply.error_code,
                message = reply.error_msg.as_deref().unwrap_or_default(),
                "Command rejected by server"
            );
            return;
        }
        let Some(route) = self.routes.get(&id) else {
            return;
        };
        let event = match kind {
            ReplyKind::EntityData => {
                let mut update = EntityDataUpdate {
                    data: reply.data,
                    update: reply.update,
                };
                if let Some(page) = update.data.as_mut() {
                    shift_timestamps(&mut page.data, route.ts_offset);
                }
                if let Some(entities) = update.update.as_mut() {
                    shift_timestamps(entities, route.ts_offset);
                }
                SubscriberEvent::EntityData(update)
            }
            ReplyKind::EntityCount => SubscriberEvent::EntityCount(CountUpdate {
                count: reply.count.unwrap_or_default(),
            }),
            ReplyKind::AlarmCount => SubscriberEvent::AlarmCount(CountUpdate {
                count: reply.count.unwrap_or_default(),
            }),
        };
        if route.events.send(event).is_err() {
            debug!(subscriber = id, "Subscriber event receiver dropped");
        }
    }

    fn broadcast_reconnect(&self) {
        for route in self.routes.values() {
            let _ = route.events.send(SubscriberEvent::Reconnect);
        }
    }
}

/// Moves server timestamps onto the client clock.
fn shift_timestamps(entities: &mut [EntityData], ts_offset: i64) {
    if ts_offset == 0 {
        return;
    }
    for entity in entities {
        for value in entity.latest.values_mut().flat_map(|values| values.values_mut()) {
            value.ts += ts_offset;
        }
        for value in entity.timeseries.values_mut().flatten() {
            value.ts += ts_offset;
        }
        for pair in entity.agg_latest.values_mut() {
            for value in [pair.current.as_mut(), pair.previous.as_mut()].into_iter().flatten() {
                value.ts += ts_offset;
            }
        }
    }
}

/// Shared WebSocket connection handing out per-subscription channels.
#[derive(Clone)]
pub struct TelemetryWsService {
    state: Arc<RwLock<ConnectionState>>,
    command_tx: mpsc::UnboundedSender<ServiceCommand>,
}

impl TelemetryWsService {
    /// Spawns the connection loop. Must be called inside a tokio runtime.
    pub fn connect(url: impl Into<String>, config: ConnectionConfig) -> Result<Self, EntityDataError> {
        let url = url.into();
        if url.is_empty() {
            return Err(EntityDataError::MissingUrl);
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        spawn_connection_loop(url, state.clone(), config, command_rx);

        Ok(Self { state, command_tx })
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Registers a new subscriber on this connection.
    pub fn subscriber(&self) -> (WsTelemetrySubscriber, mpsc::UnboundedReceiver<SubscriberEvent>) {
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let subscriber = WsTelemetrySubscriber {
            id,
            command_tx: self.command_tx.clone(),
        };
        subscriber.send(ServiceCommand::Register {
            id,
            events: events_tx,
        });
        (subscriber, events_rx)
    }

    pub fn disconnect(&self) {
        let _ = self.command_tx.send(ServiceCommand::Disconnect);
    }
}

/// [`TelemetrySubscriber`] backed by a [`TelemetryWsService`].
pub struct WsTelemetrySubscriber {
    id: u64,
    command_tx: mpsc::UnboundedSender<ServiceCommand>,
}

impl WsTelemetrySubscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, command: ServiceCommand) {
        if self.command_tx.send(command).is_err() {
            debug!(subscriber = self.id, error = %EntityDataError::ConnectionClosed, "Dropping subscriber command");
        }
    }
}

impl TelemetrySubscriber for WsTelemetrySubscriber {
    fn subscribe(&mut self, commands: Vec<WsCommand>) {
        self.send(ServiceCommand::Subscribe { id: self.id, commands });
    }

    fn update(&mut self, commands: Vec<WsCommand>) {
        self.send(ServiceCommand::Update { id: self.id, commands });
    }

    fn unsubscribe(&mut self) {
        self.send(ServiceCommand::Unsubscribe { id: self.id });
    }

    fn set_ts_offset(&mut self, ts_offset: i64) {
        self.send(ServiceCommand::SetTsOffset {
            id: self.id,
            ts_offset,
        });
    }
}

fn envelope(commands: &[WsCommand]) -> Option<Message> {
    if commands.is_empty() {
        return None;
    }
    match serde_json::to_string(&CommandEnvelope { cmds: commands }) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            warn!(error = %EntityDataError::from(e), "Failed to encode commands");
            None
        }
    }
}

/// Applies a subscriber command to the table; returns what must go out.
fn apply_command(routes: &mut RouteTable, command: ServiceCommand) -> Option<Vec<WsCommand>> {
    match command {
        ServiceCommand::Register { id, events } => {
            routes.routes.insert(
                id,
                Route {
                    events,
                    commands: Vec::new(),
                    ts_offset: 0,
                },
            );
            Some(Vec::new())
        }
        ServiceCommand::Subscribe { id, commands } | ServiceCommand::Update { id, commands } => {
            Some(routes.set_commands(id, commands))
        }
        ServiceCommand::Unsubscribe { id } => Some(routes.remove(id)),
        ServiceCommand::SetTsOffset { id, ts_offset } => {
            if let Some(route) = routes.routes.get_mut(&id) {
                route.ts_offset = ts_offset;
            }
            Some(Vec::new())
        }
        ServiceCommand::Disconnect => None,
    }
}

fn spawn_connection_loop(
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    config: ConnectionConfig,
    mut command_rx: mpsc::UnboundedReceiver<ServiceCommand>,
) {
    tokio::spawn(async move {
        let mut routes = RouteTable::default();
        let mut reconnect_attempt: u32 = 0;
        let mut connected_before = false;
        let mut should_run = true;

        while should_run {
            *state.write().await = ConnectionState::Connecting;

            match connect_async(&url).await {
                Ok((ws, _)) => {
                    *state.write().await = ConnectionState::Connected;
                    reconnect_attempt = 0;

                    let (mut ws_tx, mut ws_rx) = ws.split();

                    if connected_before {
                        routes.broadcast_reconnect();
                    } else if let Some(msg) = envelope(&routes.all_commands()) {
                        let _ = ws_tx.send(msg).await;
                    }
                    connected_before = true;

                    let mut ping_timer = tokio::time::interval(config.ping_interval);

                    loop {
                        tokio::select! {
                            msg = ws_rx.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        match serde_json::from_str::<CommandReply>(&text) {
                                            Ok(reply) => routes.dispatch(reply),
                                            Err(e) => debug!(error = %e, "Unrecognized message"),
                                        }
                                    }
                                    Some(Ok(Message::Ping(payload))) => {
                                        let _ = ws_tx.send(Message::Pong(payload)).await;
                                    }
                                    Some(Ok(Message::Close(_))) => {
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        warn!(error = %EntityDataError::from(e), "WebSocket read failed");
                                        break;
                                    }
                                    None => {
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                            cmd = command_rx.recv() => {
                                match cmd.and_then(|cmd| apply_command(&mut routes, cmd)) {
                                    Some(outgoing) => {
                                        if let Some(msg) = envelope(&outgoing) {
                                            let _ = ws_tx.send(msg).await;
                                        }
                                    }
                                    None => {
                                        let _ = ws_tx.close().await;
                                        *state.write().await = ConnectionState::Disconnected;
                                        should_run = false;
                                        break;
                                    }
                                }
                            }
                            _ = ping_timer.tick() => {
                                let _ = ws_tx.send(Message::Ping(vec![])).await;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %EntityDataError::ConnectionFailed(e.to_string()), "Connection failed");
                }
            }

            if !should_run {
                break;
            }

            if !config.auto_reconnect {
                *state.write().await = ConnectionState::Error;
                break;
            }

            if reconnect_attempt >= config.max_reconnect_attempts {
                warn!(error = %EntityDataError::MaxReconnectAttempts(reconnect_attempt), "Giving up");
                *state.write().await = ConnectionState::Error;
                break;
            }

            let delay = config.reconnect_delay(reconnect_attempt);

            *state.write().await = ConnectionState::Reconnecting {
                attempt: reconnect_attempt,
            };
            reconnect_attempt += 1;

            tracing::info!(
                "Reconnecting in {:?} (attempt {})",
                delay,
                reconnect_attempt
            );

            // Subscriber commands keep flowing into the table while waiting.
            let wait = sleep(delay);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    cmd = command_rx.recv() => {
                        if cmd.and_then(|cmd| apply_command(&mut routes, cmd)).is_none() {
                            *state.write().await = ConnectionState::Disconnected;
                            should_run = false;
                            break;
                        }
                    }
                }
            }
        }
    });
}
