#![allow(dead_code)]

use entity_data_sdk::prelude::*;
use entity_data_sdk::{EntityId, TsValue, WsCommand};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerCall {
    DataUpdated {
        data: DataSetHolder,
        entity_index: usize,
        key_index: usize,
        detect_changes: bool,
        is_latest: bool,
    },
    DataLoaded {
        entities: usize,
        data: Vec<Vec<DataSetHolder>>,
    },
    InitialPageDataChanged {
        entities: usize,
    },
    RealtimeRefreshRequested,
}

/// Records every callback. `refresh` is handed out on reconnect.
#[derive(Clone, Default)]
pub struct RecordingListener {
    pub calls: Arc<Mutex<Vec<ListenerCall>>>,
    pub refresh: Option<SubscriptionTimewindow>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh(mut self, timewindow: SubscriptionTimewindow) -> Self {
        self.refresh = Some(timewindow);
        self
    }

    pub fn calls(&self) -> Vec<ListenerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(usize, usize, Vec<(i64, serde_json::Value)>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ListenerCall::DataUpdated {
                    data,
                    entity_index,
                    key_index,
                    ..
                } => Some((
                    entity_index,
                    key_index,
                    data.data.into_iter().map(|p| (p.ts, p.value)).collect(),
                )),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ListenerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl EntityDataListener for RecordingListener {
    fn config_datasource_index(&self) -> usize {
        0
    }

    fn data_updated(
        &mut self,
        data: &DataSetHolder,
        _datasource_index: usize,
        entity_index: usize,
        key_index: usize,
        detect_changes: bool,
        is_latest: bool,
    ) {
        self.record(ListenerCall::DataUpdated {
            data: data.clone(),
            entity_index,
            key_index,
            detect_changes,
            is_latest,
        });
    }

    fn data_loaded(
        &mut self,
        page_data: &PageData<EntityData>,
        data: &[Vec<DataSetHolder>],
        _datasource_index: usize,
        _page_link: Option<&EntityDataPageLink>,
    ) {
        self.record(ListenerCall::DataLoaded {
            entities: page_data.data.len(),
            data: data.to_vec(),
        });
    }

    fn initial_page_data_changed(&mut self, page_data: &PageData<EntityData>) {
        self.record(ListenerCall::InitialPageDataChanged {
            entities: page_data.data.len(),
        });
    }

    fn update_realtime_subscription(&mut self) -> Option<SubscriptionTimewindow> {
        self.record(ListenerCall::RealtimeRefreshRequested);
        self.refresh.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Subscribe(Vec<WsCommand>),
    Update(Vec<WsCommand>),
    Unsubscribe,
    SetTsOffset(i64),
}

#[derive(Clone, Default)]
pub struct RecordingSubscriber {
    pub calls: Arc<Mutex<Vec<TransportCall>>>,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl TelemetrySubscriber for RecordingSubscriber {
    fn subscribe(&mut self, commands: Vec<WsCommand>) {
        self.calls.lock().unwrap().push(TransportCall::Subscribe(commands));
    }

    fn update(&mut self, commands: Vec<WsCommand>) {
        self.calls.lock().unwrap().push(TransportCall::Update(commands));
    }

    fn unsubscribe(&mut self) {
        self.calls.lock().unwrap().push(TransportCall::Unsubscribe);
    }

    fn set_ts_offset(&mut self, ts_offset: i64) {
        self.calls.lock().unwrap().push(TransportCall::SetTsOffset(ts_offset));
    }
}

pub struct Harness {
    pub subscription: EntityDataSubscription,
    pub listener: RecordingListener,
    pub subscriber: RecordingSubscriber,
    pub clock: ManualClock,
}

pub async fn harness(options: SubscriptionOptions, listener: RecordingListener) -> Harness {
    let clock = ManualClock::new(60_000);
    let subscriber = RecordingSubscriber::new();
    let subscription = EntityDataSubscription::create(
        options,
        Box::new(listener.clone()),
        Some(Box::new(subscriber.clone())),
        &ExpressionCompiler::new(),
        Arc::new(clock.clone()),
        SubscriptionConfig::default(),
    )
    .await;
    Harness {
        subscription,
        listener,
        subscriber,
        clock,
    }
}

pub fn entity(id: &str) -> EntityData {
    EntityData::new(EntityId::new(id))
}

pub fn snapshot(entities: Vec<EntityData>) -> SubscriberEvent {
    SubscriberEvent::EntityData(entity_data_sdk::EntityDataUpdate::snapshot(
        PageData::single_page(entities),
    ))
}

pub fn update(entities: Vec<EntityData>) -> SubscriberEvent {
    SubscriberEvent::EntityData(entity_data_sdk::EntityDataUpdate::update(entities))
}

pub fn series(points: &[(i64, &str)]) -> Vec<TsValue> {
    points.iter().map(|(ts, value)| TsValue::new(*ts, *value)).collect()
}

pub fn as_f64(points: &[(i64, serde_json::Value)]) -> Vec<(i64, f64)> {
    points
        .iter()
        .map(|(ts, value)| (*ts, value.as_f64().unwrap_or(f64::NAN)))
        .collect()
}
