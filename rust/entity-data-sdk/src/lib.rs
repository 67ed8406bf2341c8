//! # entity-data-sdk
//!
//! Real-time entity data subscriptions for IoT dashboards.
//!
//! A subscription turns a declarative datasource description (entities,
//! data keys, a time window) into telemetry commands, reconciles page
//! snapshots with incremental updates, aggregates samples client side and
//! hands finished data sets to a listener.
//!
//! ## Example
//!
//! ```rust,ignore
//! use entity_data_sdk::prelude::*;
//!
//! let service = TelemetryWsService::connect("wss://iot.example.com/api/ws", ConnectionConfig::default())?;
//! let (subscriber, events) = service.subscriber();
//!
//! let options = SubscriptionOptions::new(
//!     DatasourceType::Entity,
//!     WidgetType::Timeseries,
//!     vec![SubscriptionDataKey::timeseries("temperature")],
//! )
//! .with_entity_filter(filter)
//! .with_timewindow(SubscriptionTimewindow::realtime(start_ts, 60_000, AggregationParams::default()));
//!
//! let mut subscription = EntityDataSubscription::create(
//!     options,
//!     Box::new(my_listener),
//!     Some(Box::new(subscriber)),
//!     &ExpressionCompiler::new(),
//!     Arc::new(SystemClock::new()),
//!     SubscriptionConfig::default(),
//! )
//! .await;
//!
//! let initial = subscription.subscribe();
//! let (handle, _task) = driver::spawn(subscription, events);
//! let loaded = initial.await?;
//! handle.start().await?;
//! ```
//!
//! ## Datasource types
//!
//! - **entity** - live entities matched by an entity filter
//! - **function** - values generated locally by user functions
//! - **entityCount** - number of entities matched by a filter
//! - **alarmCount** - number of alarms matched by an alarm filter

pub mod aggregator;
pub mod clock;
pub mod command;
pub mod config;
pub mod connection;
mod datasource;
pub mod driver;
pub mod error;
pub mod key_registry;
pub mod listener;
pub mod prelude;
mod reconciler;
mod scheduler;
pub mod script;
pub mod subscription;
pub mod telemetry;
pub mod timewindow;
pub mod transport;
pub mod types;
pub mod value;

pub use aggregator::{AggregatorEmission, DataAggregator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{AlarmCountFilter, EntityDataCmd, KeyFields, WsCommand};
pub use config::{ConnectionConfig, SubscriptionConfig};
pub use connection::{ConnectionState, TelemetryWsService, WsTelemetrySubscriber};
pub use driver::SubscriptionHandle;
pub use error::{EntityDataError, ScriptError};
pub use key_registry::{DataKeyId, KeyRegistry, SubscriptionDataKey};
pub use listener::{EntityDataListener, EntityDataLoadResult};
pub use reconciler::comparison_value;
pub use script::{ExpressionCompiler, PostArgs, PostFunction, ScriptCompiler, ValueFunction};
pub use subscription::{
    EntityDataSubscription, LifecycleState, SubscriptionOptions, NOT_SUPPORTED,
};
pub use telemetry::TelemetryConfig;
pub use timewindow::{
    AggregationParams, ComparisonDuration, FixedWindow, IntervalType, SubscriptionTimewindow,
};
pub use transport::{CountUpdate, EntityDataUpdate, SubscriberEvent, TelemetrySubscriber};
pub use types::{
    AggregationType, ComparisonResultType, ComparisonTsValue, DataKeyType, DataPoint, DataSet,
    DataSetHolder, DatasourceType, EntityData, EntityDataPageLink, EntityId, EntityKeyType,
    PageData, TsValue, WidgetType, NULL_UUID,
};

pub use serde_json::Value;
