//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use entity_data_sdk::prelude::*;
//! ```

pub use crate::driver;
pub use crate::{
    AggregationParams, AggregationType, Clock, ComparisonDuration, ComparisonResultType,
    ConnectionConfig, DataKeyType, DataSetHolder, DatasourceType, EntityData,
    EntityDataListener, EntityDataLoadResult, EntityDataPageLink, EntityDataSubscription,
    ExpressionCompiler, FixedWindow, ManualClock, PageData, SubscriberEvent, SubscriptionConfig,
    SubscriptionDataKey, SubscriptionHandle, SubscriptionOptions, SubscriptionTimewindow,
    SystemClock, TelemetrySubscriber, TelemetryWsService, WidgetType,
};

pub use std::sync::Arc;
