//! The entity data subscription: lifecycle, reconciliation of snapshots and
//! updates, client-side aggregation and function generation.
//!
//! The subscription is a synchronous state machine. Transport events are
//! pushed in through [`EntityDataSubscription::on_event`] and timers are
//! exposed as deadlines on the injected [`Clock`]; the owner (or
//! [`crate::driver`]) calls [`EntityDataSubscription::fire_due_timers`] when
//! the earliest deadline passes.

use crate::aggregator::{AggregatorEmission, DataAggregator};
use crate::clock::Clock;
use crate::command::{AlarmCountFilter, KeyFields};
use crate::config::SubscriptionConfig;
use crate::datasource::{CommandContext, DatasourceHandler, EntityQuery, Inbound, Opening};
use crate::key_registry::{series_name, KeyRegistry, SubscriptionDataKey};
use crate::listener::{
    DataSink, EntityDataListener, EntityDataLoadResult, InitialDataCollector, ListenerSink,
};
use crate::reconciler::{ApplyMode, Reconciler};
use crate::scheduler::{
    generate_latest, generate_series, history_range, realtime_range, series_frequency,
    FunctionScheduler, TickClock,
};
use crate::script::ScriptCompiler;
use crate::timewindow::{is_floating, SubscriptionTimewindow};
use crate::transport::{SubscriberEvent, TelemetrySubscriber};
use crate::types::{
    latest_to_subscription_data, timeseries_to_subscription_data, DataKeyType, DataPoint,
    DatasourceType, EntityData, EntityDataPageLink, PageData, SubscriptionData, WidgetType,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Value reported for aggregated keys that cannot be served on a floating
/// window.
pub const NOT_SUPPORTED: &str = "Not supported";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    ResolvingFirstSnapshot,
    SteadyState,
    TornDown,
}

/// Declarative description of what a widget datasource wants.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub datasource_type: DatasourceType,
    pub widget_type: WidgetType,
    pub data_keys: Vec<SubscriptionDataKey>,
    pub entity_filter: Option<Value>,
    pub is_paginated: bool,
    pub page_link: Option<EntityDataPageLink>,
    pub key_filters: Vec<Value>,
    pub additional_key_filters: Vec<Value>,
    pub alarm_filter: Option<AlarmCountFilter>,
    pub subscription_timewindow: Option<SubscriptionTimewindow>,
}

impl SubscriptionOptions {
    pub fn new(
        datasource_type: DatasourceType,
        widget_type: WidgetType,
        data_keys: Vec<SubscriptionDataKey>,
    ) -> Self {
        Self {
            datasource_type,
            widget_type,
            data_keys,
            entity_filter: None,
            is_paginated: false,
            page_link: None,
            key_filters: Vec::new(),
            additional_key_filters: Vec::new(),
            alarm_filter: None,
            subscription_timewindow: None,
        }
    }

    pub fn with_entity_filter(mut self, filter: Value) -> Self {
        self.entity_filter = Some(filter);
        self
    }

    pub fn with_timewindow(mut self, timewindow: SubscriptionTimewindow) -> Self {
        self.subscription_timewindow = Some(timewindow);
        self
    }

    pub fn with_page_link(mut self, page_link: EntityDataPageLink) -> Self {
        self.page_link = Some(page_link);
        self
    }

    pub fn paginated(mut self, page_link: EntityDataPageLink) -> Self {
        self.is_paginated = true;
        self.page_link = Some(page_link);
        self
    }

    pub fn with_key_filters(mut self, key_filters: Vec<Value>, additional: Vec<Value>) -> Self {
        self.key_filters = key_filters;
        self.additional_key_filters = additional;
        self
    }

    pub fn with_alarm_filter(mut self, filter: AlarmCountFilter) -> Self {
        self.alarm_filter = Some(filter);
        self
    }
}

pub struct EntityDataSubscription {
    paginated: bool,
    page_link: Option<EntityDataPageLink>,
    timewindow: Option<SubscriptionTimewindow>,
    registry: KeyRegistry,
    fields: KeyFields,
    handler: DatasourceHandler,
    listener: Box<dyn EntityDataListener>,
    subscriber: Option<Box<dyn TelemetrySubscriber>>,
    clock: Arc<dyn Clock>,
    config: SubscriptionConfig,

    state: LifecycleState,
    started: bool,
    /// Window in effect since `start()` (or `subscribe()` when paginated).
    subs_tw: Option<SubscriptionTimewindow>,
    reconciler: Reconciler,
    aggregators: Vec<DataAggregator>,
    scheduler: FunctionScheduler,
    resolver: Option<oneshot::Sender<Option<EntityDataLoadResult>>>,
    cancel: CancellationToken,
}

impl EntityDataSubscription {
    /// Compiles user functions and builds the key registry and commands.
    /// `subscriber` may be `None` for function datasources.
    pub async fn create(
        options: SubscriptionOptions,
        listener: Box<dyn EntityDataListener>,
        subscriber: Option<Box<dyn TelemetrySubscriber>>,
        compiler: &dyn ScriptCompiler,
        clock: Arc<dyn Clock>,
        config: SubscriptionConfig,
    ) -> Self {
        let registry = KeyRegistry::build(
            options.data_keys,
            options.datasource_type,
            options.widget_type,
            compiler,
        )
        .await;
        let fields = KeyFields::from_registry(&registry);
        let handler = {
            let ctx = CommandContext {
                registry: &registry,
                fields: &fields,
                timewindow: options.subscription_timewindow.as_ref(),
                paginated: options.is_paginated,
            };
            let query = EntityQuery {
                entity_filter: options.entity_filter.unwrap_or(Value::Null),
                page_link: options.page_link.clone(),
                key_filters: options.key_filters,
                additional_key_filters: options.additional_key_filters,
                alarm_filter: options.alarm_filter,
            };
            DatasourceHandler::new(options.datasource_type, query, &ctx)
        };

        debug!(
            datasource = options.datasource_type.as_str(),
            keys = registry.len(),
            paginated = options.is_paginated,
            "Created entity data subscription"
        );

        Self {
            paginated: options.is_paginated,
            page_link: options.page_link,
            timewindow: options.subscription_timewindow,
            registry,
            fields,
            handler,
            listener,
            subscriber,
            clock,
            config,
            state: LifecycleState::Uninitialized,
            started: false,
            subs_tw: None,
            reconciler: Reconciler::default(),
            aggregators: Vec::new(),
            scheduler: FunctionScheduler::default(),
            resolver: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn page_data(&self) -> Option<&PageData<EntityData>> {
        self.reconciler.page_data()
    }

    /// Token cancelled by `unsubscribe()`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Opens the subscription. The receiver resolves with the first
    /// snapshot, or immediately with `None` for paginated subscriptions.
    pub fn subscribe(&mut self) -> oneshot::Receiver<Option<EntityDataLoadResult>> {
        let (tx, rx) = oneshot::channel();
        if self.state != LifecycleState::Uninitialized {
            warn!(state = ?self.state, "subscribe() called on an already opened subscription");
            let _ = tx.send(None);
            return rx;
        }
        self.state = LifecycleState::ResolvingFirstSnapshot;

        if self.paginated {
            self.started = true;
            self.subs_tw = self.timewindow.clone();
            self.apply_ts_offset();
            let _ = tx.send(None);
        } else {
            self.resolver = Some(tx);
        }

        match self.handler.opening(self.clock.wall_ms()) {
            Opening::Transport(commands) => match self.subscriber.as_mut() {
                Some(subscriber) => {
                    debug!(cmds = commands.len(), "Subscribing");
                    subscriber.subscribe(commands);
                }
                None => warn!("No telemetry subscriber attached; nothing will be received"),
            },
            Opening::Synthetic(page) => self.on_page_data(page),
        }
        rx
    }

    /// Switches from the initial load to live data. No-op when paginated.
    pub fn start(&mut self) {
        if self.paginated {
            return;
        }
        if self.state == LifecycleState::TornDown {
            warn!("start() called after unsubscribe()");
            return;
        }
        self.subs_tw = self.timewindow.clone();
        self.apply_ts_offset();

        if let Some(page) = self.reconciler.take_page() {
            self.prepare_data(&page, None);
            self.reconciler.store_page(page);
        }

        let ctx = CommandContext {
            registry: &self.registry,
            fields: &self.fields,
            timewindow: self.subs_tw.as_ref(),
            paginated: self.paginated,
        };
        if let Some(commands) = self.handler.start_commands(&ctx) {
            if let Some(subscriber) = self.subscriber.as_mut() {
                debug!(cmds = commands.len(), "Sending subscription commands");
                subscriber.update(commands);
            }
        }

        if self.registry.datasource_type() == DatasourceType::Function {
            self.start_function();
        }
        self.started = true;
    }

    /// Releases timers, aggregators and the transport registration. Safe in
    /// any state; no listener call happens afterwards.
    pub fn unsubscribe(&mut self) {
        if self.state == LifecycleState::TornDown {
            return;
        }
        self.cancel.cancel();
        self.scheduler.stop();
        for aggregator in &mut self.aggregators {
            aggregator.destroy();
        }
        self.aggregators.clear();
        if let Some(mut subscriber) = self.subscriber.take() {
            subscriber.unsubscribe();
        }
        self.reconciler.clear();
        self.resolver = None;
        self.started = false;
        self.state = LifecycleState::TornDown;
        debug!("Entity data subscription torn down");
    }

    pub fn on_event(&mut self, event: SubscriberEvent) {
        if self.state == LifecycleState::TornDown {
            debug!("Dropping transport event after teardown");
            return;
        }
        if event == SubscriberEvent::Reconnect {
            self.on_reconnect();
            return;
        }
        match self.handler.on_event(event, self.clock.wall_ms()) {
            Some(Inbound::Snapshot(page)) => self.on_page_data(page),
            Some(Inbound::Update(update)) => self.on_data_update(update),
            None => {}
        }
    }

    /// Earliest pending timer, in monotonic milliseconds.
    pub fn next_deadline(&self) -> Option<i64> {
        self.aggregators
            .iter()
            .filter_map(DataAggregator::next_deadline)
            .chain(self.scheduler.next_deadline())
            .min()
    }

    pub fn time_until_next_deadline(&self) -> Option<Duration> {
        let now = self.clock.monotonic_ms();
        self.next_deadline()
            .map(|deadline| Duration::from_millis((deadline - now).max(0) as u64))
    }

    pub fn pending_timers(&self) -> usize {
        self.aggregators
            .iter()
            .filter(|aggregator| aggregator.next_deadline().is_some())
            .count()
            + self.scheduler.pending()
    }

    /// Runs every timer whose deadline has passed.
    pub fn fire_due_timers(&mut self) {
        if self.state == LifecycleState::TornDown {
            return;
        }
        let now = self.clock.monotonic_ms();
        for index in 0..self.aggregators.len() {
            if let Some(emission) = self.aggregators[index].on_timer(now) {
                self.deliver_emission(index, emission);
            }
        }
        if self.scheduler.series.as_ref().is_some_and(|clock| clock.is_due(now)) {
            self.on_series_tick(now);
        }
        if self.scheduler.latest.as_ref().is_some_and(|clock| clock.is_due(now)) {
            self.on_latest_tick(now);
        }
    }

    fn history(&self) -> bool {
        self.subs_tw.as_ref().is_some_and(SubscriptionTimewindow::is_history)
    }

    fn realtime(&self) -> bool {
        self.subs_tw.as_ref().is_some_and(SubscriptionTimewindow::is_realtime)
    }

    fn apply_ts_offset(&mut self) {
        if let (Some(tw), Some(subscriber)) = (self.subs_tw.as_ref(), self.subscriber.as_mut()) {
            subscriber.set_ts_offset(tw.ts_offset);
        }
    }

    fn on_page_data(&mut self, page: PageData<EntityData>) {
        let is_initial = !self.reconciler.has_snapshot();
        if !is_initial && !self.paginated {
            if let Some(current) = self.reconciler.page_data() {
                if current.membership_differs(&page) {
                    info!(
                        entities = page.data.len(),
                        "Entity set changed; keeping current state"
                    );
                    self.listener.initial_page_data_changed(&page);
                    return;
                }
            }
        }

        let collect = is_initial || self.paginated;
        let mut collector = InitialDataCollector::new(page.data.len(), self.registry.len());
        if self.paginated || (is_initial && self.started) {
            self.prepare_data(&page, Some(&mut collector));
        } else if is_initial {
            self.reconciler.reset_buffers(&page, self.registry.len());
            self.reset_key_times();
        }

        for (index, entity) in page.data.iter().enumerate() {
            let sink = if collect { Some(&mut collector) } else { None };
            self.process_entity_data(entity, index, false, sink);
        }

        if collect {
            let data = collector.into_data();
            let datasource_index = self.listener.config_datasource_index();
            match self.resolver.take() {
                Some(resolver) => {
                    let result = EntityDataLoadResult {
                        page_data: page.clone(),
                        data,
                        datasource_index,
                        page_link: self.page_link.clone(),
                    };
                    if resolver.send(Some(result)).is_err() {
                        debug!("Initial load result dropped by the caller");
                    }
                }
                None => self.listener.data_loaded(
                    &page,
                    &data,
                    datasource_index,
                    self.page_link.as_ref(),
                ),
            }
        }
        self.reconciler.store_page(page);

        if is_initial {
            self.state = LifecycleState::SteadyState;
            if self.paginated && self.registry.datasource_type() == DatasourceType::Function {
                self.start_function();
            }
            let premature = self.reconciler.take_premature();
            if !premature.is_empty() {
                debug!(updates = premature.len(), "Replaying updates received before the snapshot");
            }
            for update in premature {
                self.on_data_update(update);
            }
        }
    }

    fn on_data_update(&mut self, update: Vec<EntityData>) {
        if !self.reconciler.has_snapshot() {
            self.reconciler.buffer_premature(update);
            return;
        }
        for entity in &update {
            match self.reconciler.entity_index(&entity.entity_id.id) {
                Some(index) => self.process_entity_data(entity, index, true, None),
                None => debug!(entity = %entity.entity_id.id, "Update for unknown entity"),
            }
        }
    }

    /// Applies one entity's payload. Output goes to `collector` while a
    /// snapshot is being assembled, to the listener otherwise.
    fn process_entity_data(
        &mut self,
        entity: &EntityData,
        index: usize,
        is_update: bool,
        collector: Option<&mut InitialDataCollector>,
    ) {
        let history = self.history();
        let replace = self.realtime();
        let mut listener_sink;
        let sink: &mut dyn DataSink = match collector {
            Some(collector) => collector,
            None => {
                listener_sink = ListenerSink::new(self.listener.as_mut());
                &mut listener_sink
            }
        };
        let registry = &self.registry;
        let reconciler = &mut self.reconciler;
        let timeseries_widget = registry.widget_type() == WidgetType::Timeseries;

        for (key_type, values) in &entity.latest {
            let data = latest_to_subscription_data(values);
            reconciler.apply_named(
                registry,
                &data,
                key_type.to_data_key_type(),
                timeseries_widget,
                index,
                ApplyMode::Latest,
                true,
                sink,
            );
        }

        if !entity.agg_latest.is_empty() {
            reconciler.apply_indexed(registry, &entity.agg_latest, index, true, sink);
        }

        if timeseries_widget && !entity.timeseries.is_empty() {
            let data = timeseries_to_subscription_data(&entity.timeseries);
            if let Some(aggregator) = self.aggregators.get_mut(index) {
                let now = self.clock.monotonic_ms();
                if let Some(emission) = aggregator.on_data(&data, false, history, true, now) {
                    apply_emission(reconciler, registry, &emission, index, sink);
                }
            }
            if !history && !is_update {
                reconciler.apply_named(
                    registry,
                    &data,
                    DataKeyType::Timeseries,
                    false,
                    index,
                    ApplyMode::Series { replace },
                    true,
                    sink,
                );
            }
        }
    }

    /// Resets buffers and recreates aggregators for `page`.
    fn prepare_data(
        &mut self,
        page: &PageData<EntityData>,
        collector: Option<&mut InitialDataCollector>,
    ) {
        self.scheduler.stop();
        for aggregator in &mut self.aggregators {
            aggregator.destroy();
        }
        self.aggregators.clear();
        self.reconciler.reset_buffers(page, self.registry.len());
        self.reset_key_times();

        if self.registry.widget_type() == WidgetType::Timeseries {
            let aggregate = self.registry.datasource_type() == DatasourceType::Function
                || !self.fields.ts_fields.is_empty();
            if let (true, Some(tw)) = (aggregate, self.subs_tw.as_ref()) {
                let now = self.clock.monotonic_ms();
                let min_period = self.config.min_aggregation_ms();
                self.aggregators = page
                    .data
                    .iter()
                    .map(|_| DataAggregator::new(tw, min_period, now))
                    .collect();
            }
        }

        self.report_unsupported_aggregation(collector);
    }

    /// Aggregated keys on a floating window get a marker value instead of
    /// server data.
    fn report_unsupported_aggregation(&mut self, collector: Option<&mut InitialDataCollector>) {
        if !self.fields.has_aggregation() || !is_floating(self.subs_tw.as_ref()) {
            return;
        }
        let marker = [DataPoint::new(self.clock.wall_ms(), NOT_SUPPORTED)];
        let keys: Vec<usize> = self
            .fields
            .agg_ts_values
            .iter()
            .chain(&self.fields.agg_ts_comparison_values)
            .copied()
            .collect();

        let mut listener_sink;
        let sink: &mut dyn DataSink = match collector {
            Some(collector) => collector,
            None => {
                listener_sink = ListenerSink::new(self.listener.as_mut());
                &mut listener_sink
            }
        };
        for entity in 0..self.reconciler.entity_count() {
            for &key_index in &keys {
                self.reconciler.apply(
                    &self.registry,
                    key_index,
                    entity,
                    &marker,
                    ApplyMode::Latest,
                    true,
                    sink,
                );
            }
        }
    }

    fn reset_key_times(&mut self) {
        for index in 0..self.registry.len() {
            if let Some(key) = self.registry.key_mut(index) {
                key.last_update_time = None;
            }
        }
    }

    fn deliver_emission(&mut self, entity: usize, emission: AggregatorEmission) {
        let mut sink = ListenerSink::new(self.listener.as_mut());
        apply_emission(&mut self.reconciler, &self.registry, &emission, entity, &mut sink);
    }

    fn on_reconnect(&mut self) {
        if !self.handler.uses_transport() {
            return;
        }
        if self.started && self.needs_realtime_refresh() {
            match self.listener.update_realtime_subscription() {
                Some(tw) => {
                    let now = self.clock.monotonic_ms();
                    for aggregator in &mut self.aggregators {
                        aggregator.reset(
                            tw.start_ts,
                            tw.aggregation.time_window,
                            tw.aggregation.interval,
                            now,
                        );
                    }
                    self.subs_tw = Some(tw);
                    self.apply_ts_offset();
                }
                None => debug!("Owner kept the current realtime window"),
            }
        }

        let ctx = CommandContext {
            registry: &self.registry,
            fields: &self.fields,
            timewindow: self.subs_tw.as_ref(),
            paginated: self.paginated,
        };
        let commands = self.handler.reconnect_commands(&ctx, self.started);
        if let Some(subscriber) = self.subscriber.as_mut() {
            info!(cmds = commands.len(), "Resending subscription commands after reconnect");
            subscriber.update(commands);
        }
    }

    /// Realtime windows move while disconnected; fixed ones do not.
    fn needs_realtime_refresh(&self) -> bool {
        let Some(tw) = self.subs_tw.as_ref() else {
            return false;
        };
        if tw.is_history() {
            return false;
        }
        let raw_series = self.registry.widget_type() == WidgetType::Timeseries
            && !self.fields.ts_fields.is_empty();
        let aggregated = self.fields.has_aggregation() && tw.is_realtime() && !tw.is_floating();
        raw_series || aggregated
    }

    fn start_function(&mut self) {
        let now = self.clock.monotonic_ms();
        self.scheduler.stop();
        let latest_keys = !self.latest_function_keys().is_empty();

        if self.registry.widget_type() == WidgetType::Timeseries {
            let max_tick = self.config.max_tick_ms();
            let window = self
                .subs_tw
                .as_ref()
                .map(|tw| (tw.is_history(), tw.is_realtime(), series_frequency(tw, max_tick)));
            match window {
                Some((true, _, _)) => self.on_series_tick(now),
                Some((false, true, frequency)) => {
                    self.scheduler.series = Some(TickClock::new(frequency, now));
                }
                _ => warn!("Function datasource in a time-series widget needs a time window"),
            }
        }
        if latest_keys {
            self.scheduler.latest = Some(TickClock::new(self.config.latest_tick_ms(), now));
        }
    }

    fn latest_function_keys(&self) -> Vec<usize> {
        let timeseries_widget = self.registry.widget_type() == WidgetType::Timeseries;
        self.registry
            .keys()
            .iter()
            .filter(|key| !timeseries_widget || key.latest)
            .map(SubscriptionDataKey::index)
            .collect()
    }

    fn on_series_tick(&mut self, now: i64) {
        let Some(tw) = self.subs_tw.clone() else {
            return;
        };
        let history = tw.is_history();
        let frequency = series_frequency(&tw, self.config.max_tick_ms());
        let delta_elapsed = match self.scheduler.series.as_mut() {
            Some(clock) if !history => clock.tick(now) * clock.frequency(),
            _ => frequency,
        };
        let wall_now = self.clock.wall_ms();

        let mut generated = SubscriptionData::new();
        for index in self.registry.function_series() {
            if self.cancel.is_cancelled() {
                break;
            }
            let prev = self
                .reconciler
                .last_point(0, index)
                .cloned()
                .unwrap_or_else(DataPoint::origin);
            let Some(key) = self.registry.key_mut(index) else {
                continue;
            };
            let range = if history {
                history_range(&tw)
            } else {
                Some(realtime_range(key, &tw, frequency, delta_elapsed, wall_now))
            };
            let Some((start, end)) = range else {
                continue;
            };
            let series = generate_series(key, prev, start, end, frequency, &self.cancel);
            generated.insert(series_name(key), series);
        }

        let emission = self
            .aggregators
            .first_mut()
            .and_then(|aggregator| aggregator.on_data(&generated, true, history, true, now));
        if let Some(emission) = emission {
            self.deliver_emission(0, emission);
        }

        if !history && !self.cancel.is_cancelled() {
            if let Some(clock) = self.scheduler.series.as_mut() {
                clock.rearm(now);
            }
        }
    }

    fn on_latest_tick(&mut self, now: i64) {
        if let Some(clock) = self.scheduler.latest.as_mut() {
            clock.tick(now);
        }
        let wall_now = self.clock.wall_ms();
        for index in self.latest_function_keys() {
            if self.cancel.is_cancelled() {
                break;
            }
            let prev = self
                .reconciler
                .last_point(0, index)
                .cloned()
                .unwrap_or_else(DataPoint::origin);
            let Some(key) = self.registry.key_mut(index) else {
                continue;
            };
            if let Some(point) = generate_latest(key, &prev, wall_now) {
                let mut sink = ListenerSink::new(self.listener.as_mut());
                self.reconciler.apply(
                    &self.registry,
                    index,
                    0,
                    &[point],
                    ApplyMode::Latest,
                    true,
                    &mut sink,
                );
            }
        }
        if let Some(clock) = self.scheduler.latest.as_mut() {
            clock.rearm(now);
        }
    }
}

impl Drop for EntityDataSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Routes aggregator output by series name. Every emission carries the
/// whole recomputed window, so it replaces the key's buffer in both
/// realtime and history mode.
fn apply_emission(
    reconciler: &mut Reconciler,
    registry: &KeyRegistry,
    emission: &AggregatorEmission,
    entity: usize,
    sink: &mut dyn DataSink,
) {
    let key_type = match registry.datasource_type() {
        DatasourceType::Function => DataKeyType::Function,
        _ => DataKeyType::Timeseries,
    };
    reconciler.apply_named(
        registry,
        &emission.data,
        key_type,
        false,
        entity,
        ApplyMode::Series { replace: true },
        emission.detect_changes,
        sink,
    );
}
