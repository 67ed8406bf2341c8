//! Boundary towards the subscription owner.

use crate::timewindow::SubscriptionTimewindow;
use crate::types::{DataSetHolder, EntityData, EntityDataPageLink, PageData};

/// Result of the first snapshot of a non-paginated subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDataLoadResult {
    pub page_data: PageData<EntityData>,
    /// Per entity, per request index.
    pub data: Vec<Vec<DataSetHolder>>,
    pub datasource_index: usize,
    pub page_link: Option<EntityDataPageLink>,
}

/// Callbacks invoked by an [`EntityDataSubscription`](crate::EntityDataSubscription).
///
/// All calls happen on the thread driving the subscription, never
/// concurrently and never after `unsubscribe()`.
pub trait EntityDataListener: Send {
    /// Index of the datasource in the owning widget's config.
    fn config_datasource_index(&self) -> usize;

    /// A new value landed for one key of one entity. `key_index` is the
    /// key's position in the original request. `is_latest` marks keys
    /// requested as latest values inside a time-series widget.
    fn data_updated(
        &mut self,
        data: &DataSetHolder,
        datasource_index: usize,
        entity_index: usize,
        key_index: usize,
        detect_changes: bool,
        is_latest: bool,
    );

    /// A snapshot resolved after the initial load (or any snapshot of a
    /// paginated subscription).
    fn data_loaded(
        &mut self,
        page_data: &PageData<EntityData>,
        data: &[Vec<DataSetHolder>],
        datasource_index: usize,
        page_link: Option<&EntityDataPageLink>,
    );

    /// The entity set changed after initialization. The subscription keeps
    /// its state and the owner is expected to re-create it.
    fn initial_page_data_changed(&mut self, page_data: &PageData<EntityData>) {
        let _ = page_data;
    }

    /// Fresh realtime window, requested while handling a transport reconnect.
    fn update_realtime_subscription(&mut self) -> Option<SubscriptionTimewindow> {
        None
    }
}

/// Destination of processed data sets.
pub(crate) trait DataSink {
    fn deliver(
        &mut self,
        data: &DataSetHolder,
        entity_index: usize,
        key_index: usize,
        detect_changes: bool,
        is_latest: bool,
    );
}

pub(crate) struct ListenerSink<'a> {
    listener: &'a mut dyn EntityDataListener,
}

impl<'a> ListenerSink<'a> {
    pub(crate) fn new(listener: &'a mut dyn EntityDataListener) -> Self {
        Self { listener }
    }
}

impl DataSink for ListenerSink<'_> {
    fn deliver(
        &mut self,
        data: &DataSetHolder,
        entity_index: usize,
        key_index: usize,
        detect_changes: bool,
        is_latest: bool,
    ) {
        let datasource_index = self.listener.config_datasource_index();
        self.listener.data_updated(
            data,
            datasource_index,
            entity_index,
            key_index,
            detect_changes,
            is_latest,
        );
    }
}

/// Gathers the data sets produced while applying a snapshot.
pub(crate) struct InitialDataCollector {
    data: Vec<Vec<DataSetHolder>>,
}

impl InitialDataCollector {
    pub(crate) fn new(entity_count: usize, key_count: usize) -> Self {
        Self {
            data: vec![vec![DataSetHolder::default(); key_count]; entity_count],
        }
    }

    pub(crate) fn into_data(self) -> Vec<Vec<DataSetHolder>> {
        self.data
    }
}

impl DataSink for InitialDataCollector {
    fn deliver(
        &mut self,
        data: &DataSetHolder,
        entity_index: usize,
        key_index: usize,
        _detect_changes: bool,
        _is_latest: bool,
    ) {
        if let Some(slot) = self
            .data
            .get_mut(entity_index)
            .and_then(|keys| keys.get_mut(key_index))
        {
            *slot = data.clone();
        }
    }
}
