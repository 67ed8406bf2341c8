mod common;

use common::*;
use entity_data_sdk::prelude::*;
use entity_data_sdk::{
    ComparisonTsValue, CountUpdate, EntityKeyType, LifecycleState, TsValue, WsCommand,
    NOT_SUPPORTED,
};
use serde_json::json;

fn latest_widget(keys: Vec<SubscriptionDataKey>) -> SubscriptionOptions {
    SubscriptionOptions::new(DatasourceType::Entity, WidgetType::Latest, keys)
        .with_entity_filter(json!({"type": "entityType", "entityType": "DEVICE"}))
}

fn realtime(interval: i64, agg_type: AggregationType) -> SubscriptionTimewindow {
    SubscriptionTimewindow::realtime(
        0,
        60_000,
        AggregationParams {
            interval,
            limit: 1_000,
            agg_type,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_updates_before_snapshot_are_replayed_in_order() {
    let options = latest_widget(vec![SubscriptionDataKey::attribute("temperature")]);
    let mut h = harness(options, RecordingListener::new()).await;

    let initial = h.subscription.subscribe();
    h.subscription.on_event(update(vec![entity("E1").with_latest(
        EntityKeyType::Attribute,
        "temperature",
        TsValue::new(5, "20"),
    )]));
    h.subscription.on_event(update(vec![entity("E1").with_latest(
        EntityKeyType::Attribute,
        "temperature",
        TsValue::new(6, "21"),
    )]));
    assert!(h.listener.calls().is_empty());

    h.subscription.on_event(snapshot(vec![entity("E1"), entity("E2")]));

    let loaded = initial.await.unwrap().unwrap();
    assert_eq!(loaded.page_data.data.len(), 2);
    assert!(loaded.data[0][0].data.is_empty());
    assert_eq!(h.subscription.state(), LifecycleState::SteadyState);

    let updates = h.listener.updates();
    assert_eq!(
        updates,
        vec![
            (0, 0, vec![(5, json!(20))]),
            (0, 0, vec![(6, json!(21))]),
        ]
    );
}

#[tokio::test]
async fn test_membership_change_is_reported_without_data() {
    let options = latest_widget(vec![SubscriptionDataKey::attribute("temperature")]);
    let mut h = harness(options, RecordingListener::new()).await;

    let _initial = h.subscription.subscribe();
    h.subscription.on_event(snapshot(vec![entity("A"), entity("B")]));
    h.subscription.start();
    h.subscription.on_event(snapshot(vec![
        entity("A").with_latest(EntityKeyType::Attribute, "temperature", TsValue::new(7, "30")),
        entity("C").with_latest(EntityKeyType::Attribute, "temperature", TsValue::new(7, "31")),
    ]));

    assert_eq!(
        h.listener.calls(),
        vec![ListenerCall::InitialPageDataChanged { entities: 2 }]
    );
    let page = h.subscription.page_data().unwrap();
    let ids: Vec<&str> = page.data.iter().map(|e| e.entity_id.id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B"]);

    h.subscription.on_event(update(vec![entity("B").with_latest(
        EntityKeyType::Attribute,
        "temperature",
        TsValue::new(9, "32"),
    )]));
    assert_eq!(h.listener.updates(), vec![(1, 0, vec![(9, json!(32))])]);
}

#[tokio::test]
async fn test_refresh_with_same_entities_updates_listener() {
    let options = latest_widget(vec![SubscriptionDataKey::attribute("temperature")]);
    let mut h = harness(options, RecordingListener::new()).await;

    let _initial = h.subscription.subscribe();
    h.subscription.on_event(snapshot(vec![entity("E1")]));
    h.subscription.start();
    h.subscription.on_event(snapshot(vec![entity("E1").with_latest(
        EntityKeyType::Attribute,
        "temperature",
        TsValue::new(8, "31"),
    )]));

    assert_eq!(h.listener.updates(), vec![(0, 0, vec![(8, json!(31))])]);
}

/// Both samples of the update reach the listener in a single `data_updated`
/// call. The aggregator recomputes once per batch, not once per sample.
#[tokio::test]
async fn test_realtime_series_update_lands_in_one_emission() {
    let options = SubscriptionOptions::new(
        DatasourceType::Entity,
        WidgetType::Timeseries,
        vec![SubscriptionDataKey::timeseries("temperature")],
    )
    .with_entity_filter(json!({"type": "singleEntity"}))
    .with_timewindow(realtime(10_000, AggregationType::None));
    let mut h = harness(options, RecordingListener::new()).await;

    let initial = h.subscription.subscribe();
    h.subscription.on_event(snapshot(vec![entity("E1")]));
    let loaded = initial.await.unwrap().unwrap();
    assert_eq!(loaded.data.len(), 1);

    h.subscription.start();
    h.subscription.on_event(update(vec![entity("E1").with_timeseries(
        "temperature",
        series(&[(1_000, "21.5"), (11_000, "22.0")]),
    )]));

    let calls = h.listener.calls();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        ListenerCall::DataUpdated {
            data,
            entity_index,
            key_index,
            detect_changes,
            is_latest,
        } => {
            assert_eq!((*entity_index, *key_index), (0, 0));
            assert!(*detect_changes);
            assert!(!*is_latest);
            let points: Vec<_> = data.data.iter().map(|p| (p.ts, p.value.clone())).collect();
            assert_eq!(as_f64(&points), vec![(1_000, 21.5), (11_000, 22.0)]);
        }
        other => panic!("unexpected call {:?}", other),
    }
    assert!(h.subscription.pending_timers() > 0);
}

#[tokio::test]
async fn test_history_series_updates_replace_the_window() {
    let options = SubscriptionOptions::new(
        DatasourceType::Entity,
        WidgetType::Timeseries,
        vec![SubscriptionDataKey::timeseries("temperature")],
    )
    .with_timewindow(SubscriptionTimewindow::history(
        FixedWindow::new(0, 60_000),
        AggregationParams::default(),
    ));
    let mut h = harness(options, RecordingListener::new()).await;

    let _initial = h.subscription.subscribe();
    h.subscription.on_event(snapshot(vec![entity("E1")]));
    h.subscription.start();
    h.subscription.on_event(update(vec![
        entity("E1").with_timeseries("temperature", series(&[(1_000, "1")]))
    ]));
    h.subscription.on_event(update(vec![
        entity("E1").with_timeseries("temperature", series(&[(2_000, "2")]))
    ]));

    let updates = h.listener.updates();
    assert!(updates.len() >= 2, "got {:?}", updates);
    for (_, _, points) in &updates {
        let stamps: Vec<i64> = points.iter().map(|(ts, _)| *ts).collect();
        assert!(
            stamps.windows(2).all(|pair| pair[0] < pair[1]),
            "timestamps not strictly ascending: {:?}",
            stamps
        );
    }
    let (entity_index, key_index, points) = updates.last().cloned().unwrap();
    assert_eq!((entity_index, key_index), (0, 0));
    assert_eq!(as_f64(&points), vec![(1_000, 1.0), (2_000, 2.0)]);
}

#[tokio::test]
async fn test_latest_channel_inside_timeseries_widget() {
    let options = SubscriptionOptions::new(
        DatasourceType::Entity,
        WidgetType::Timeseries,
        vec![
            SubscriptionDataKey::timeseries("temperature"),
            SubscriptionDataKey::timeseries("temperature").with_latest(true),
        ],
    )
    .with_timewindow(realtime(10_000, AggregationType::None));
    let mut h = harness(options, RecordingListener::new()).await;

    let _initial = h.subscription.subscribe();
    h.subscription.on_event(snapshot(vec![entity("E1")]));
    h.subscription.start();
    h.subscription.on_event(update(vec![entity("E1").with_latest(
        EntityKeyType::TimeSeries,
        "temperature",
        TsValue::new(1_500, "3"),
    )]));

    let calls = h.listener.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(
        &calls[0],
        ListenerCall::DataUpdated { key_index: 1, is_latest: true, .. }
    ));
}

#[tokio::test]
async fn test_aggregated_comparison_delta_percent() {
    let key = SubscriptionDataKey::timeseries("temperature")
        .with_aggregation(AggregationType::Avg)
        .with_comparison(
            ComparisonDuration::PreviousInterval,
            ComparisonResultType::DeltaPercent,
        );
    let options = latest_widget(vec![key]).with_timewindow(SubscriptionTimewindow::history(
        FixedWindow::new(0, 60_000),
        AggregationParams {
            agg_type: AggregationType::Avg,
            ..Default::default()
        },
    ));
    let mut h = harness(options, RecordingListener::new()).await;

    let initial = h.subscription.subscribe();
    h.subscription.on_event(snapshot(vec![entity("E1").with_agg_latest(
        0,
        ComparisonTsValue {
            current: Some(TsValue::new(1_000, "60")),
            previous: Some(TsValue::new(500, "40")),
        },
    )]));

    let loaded = initial.await.unwrap().unwrap();
    let points: Vec<_> = loaded.data[0][0]
        .data
        .iter()
        .map(|p| (p.ts, p.value.clone()))
        .collect();
    assert_eq!(as_f64(&points), vec![(500, 50.0)]);
}

#[tokio::test]
async fn test_floating_window_reports_unsupported_aggregation() {
    let key = SubscriptionDataKey::timeseries("temperature").with_aggregation(AggregationType::Avg);
    let options = latest_widget(vec![key]).with_timewindow(realtime(1_000, AggregationType::Avg));
    let mut h = harness(options, RecordingListener::new()).await;

    let _initial = h.subscription.subscribe();
    h.subscription.on_event(snapshot(vec![entity("E1"), entity("E2")]));
    h.subscription.start();

    assert_eq!(
        h.listener.updates(),
        vec![
            (0, 0, vec![(60_000, json!(NOT_SUPPORTED))]),
            (1, 0, vec![(60_000, json!(NOT_SUPPORTED))]),
        ]
    );
}

#[tokio::test]
async fn test_entity_count_snapshot_then_updates() {
    let options = SubscriptionOptions::new(
        DatasourceType::EntityCount,
        WidgetType::Latest,
        vec![SubscriptionDataKey::count("devices")],
    )
    .with_entity_filter(json!({"type": "entityType", "entityType": "DEVICE"}));
    let mut h = harness(options, RecordingListener::new()).await;

    let initial = h.subscription.subscribe();
    match h.subscriber.calls().first() {
        Some(TransportCall::Subscribe(cmds)) => {
            assert_eq!(cmds.len(), 1);
            assert!(matches!(cmds[0], WsCommand::EntityCount(_)));
        }
        other => panic!("expected subscribe, got {:?}", other),
    }

    h.subscription
        .on_event(SubscriberEvent::EntityCount(CountUpdate { count: 5 }));
    let loaded = initial.await.unwrap().unwrap();
    assert_eq!(loaded.page_data.data[0].entity_id.id, entity_data_sdk::NULL_UUID);
    assert_eq!(loaded.data[0][0].data.len(), 1);
    assert_eq!(loaded.data[0][0].data[0].value, json!(5));

    h.subscription.start();
    h.clock.advance(1_000);
    h.subscription
        .on_event(SubscriberEvent::EntityCount(CountUpdate { count: 7 }));
    h.subscription
        .on_event(SubscriberEvent::AlarmCount(CountUpdate { count: 99 }));

    assert_eq!(h.listener.updates(), vec![(0, 0, vec![(61_000, json!(7))])]);
}

#[tokio::test]
async fn test_function_series_ticks_and_slides() {
    let options = SubscriptionOptions::new(
        DatasourceType::Function,
        WidgetType::Timeseries,
        vec![SubscriptionDataKey::function("counter", "return prevValue + 1;")],
    )
    .with_timewindow(realtime(1_000, AggregationType::None));
    let mut h = harness(options, RecordingListener::new()).await;

    let initial = h.subscription.subscribe();
    let loaded = initial.await.unwrap().unwrap();
    assert_eq!(loaded.page_data.data.len(), 1);
    assert!(h.subscriber.calls().is_empty());

    h.subscription.start();
    assert_eq!(h.subscription.time_until_next_deadline(), Some(std::time::Duration::ZERO));
    h.subscription.fire_due_timers();

    let updates = h.listener.updates();
    assert_eq!(updates.len(), 1);
    let points = as_f64(&updates[0].2);
    assert_eq!(points.len(), 60);
    assert_eq!(points.first(), Some(&(1_000, 2.0)));
    assert_eq!(points.last(), Some(&(60_000, 61.0)));

    h.clock.advance(1_000);
    h.subscription.fire_due_timers();
    h.clock.advance(1_000);
    h.subscription.fire_due_timers();

    let updates = h.listener.updates();
    assert_eq!(updates.len(), 3);
    let last_ts: Vec<i64> = updates
        .iter()
        .map(|(_, _, points)| points.last().map(|(ts, _)| *ts).unwrap_or_default())
        .collect();
    assert_eq!(last_ts, vec![60_000, 61_000, 62_000]);
}

#[tokio::test]
async fn test_function_latest_keys_tick_every_second() {
    let options = SubscriptionOptions::new(
        DatasourceType::Function,
        WidgetType::Latest,
        vec![SubscriptionDataKey::function("counter", "prevValue + 1")],
    );
    let mut h = harness(options, RecordingListener::new()).await;

    let _initial = h.subscription.subscribe();
    h.subscription.start();
    for _ in 0..3 {
        h.subscription.fire_due_timers();
        h.clock.advance(1_000);
    }

    assert_eq!(
        h.listener.updates(),
        vec![
            (0, 0, vec![(60_000, json!(1))]),
            (0, 0, vec![(61_000, json!(2))]),
            (0, 0, vec![(62_000, json!(3))]),
        ]
    );
}

#[tokio::test]
async fn test_unsubscribe_stops_all_timers_and_callbacks() {
    let options = SubscriptionOptions::new(
        DatasourceType::Function,
        WidgetType::Timeseries,
        vec![SubscriptionDataKey::function("counter", "prevValue + 1")],
    )
    .with_timewindow(realtime(1_000, AggregationType::None));
    let mut h = harness(options, RecordingListener::new()).await;

    let _initial = h.subscription.subscribe();
    h.subscription.start();
    h.subscription.fire_due_timers();
    assert!(h.subscription.pending_timers() > 0);
    let before = h.listener.calls().len();

    h.subscription.unsubscribe();
    assert_eq!(h.subscription.pending_timers(), 0);
    assert_eq!(h.subscription.next_deadline(), None);
    assert_eq!(h.subscription.state(), LifecycleState::TornDown);
    assert!(h.subscription.cancellation_token().is_cancelled());

    h.clock.advance(10_000);
    h.subscription.fire_due_timers();
    h.subscription.on_event(snapshot(vec![entity("E1")]));
    assert_eq!(h.listener.calls().len(), before);
    assert_eq!(h.subscriber.calls(), vec![TransportCall::Unsubscribe]);

    h.subscription.unsubscribe();
    assert_eq!(h.subscriber.calls(), vec![TransportCall::Unsubscribe]);
}

#[tokio::test]
async fn test_unsubscribe_before_first_snapshot() {
    let options = latest_widget(vec![SubscriptionDataKey::attribute("temperature")]);
    let mut h = harness(options, RecordingListener::new()).await;

    let initial = h.subscription.subscribe();
    h.subscription.unsubscribe();
    h.subscription.on_event(snapshot(vec![entity("E1")]));

    assert!(initial.await.is_err());
    assert!(h.listener.calls().is_empty());
    assert_eq!(h.subscriber.calls().last(), Some(&TransportCall::Unsubscribe));
}

#[tokio::test]
async fn test_paginated_snapshots_go_to_data_loaded() {
    let page_link = EntityDataPageLink {
        page_size: 10,
        page: 0,
        ..Default::default()
    };
    let options =
        latest_widget(vec![SubscriptionDataKey::attribute("temperature")]).paginated(page_link);
    let mut h = harness(options, RecordingListener::new()).await;

    let initial = h.subscription.subscribe();
    assert!(initial.await.unwrap().is_none());
    assert!(h.subscription.is_started());

    h.subscription.on_event(snapshot(vec![entity("E1").with_latest(
        EntityKeyType::Attribute,
        "temperature",
        TsValue::new(1, "10"),
    )]));
    h.subscription
        .on_event(snapshot(vec![entity("E2"), entity("E3")]));

    let loaded: Vec<_> = h
        .listener
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ListenerCall::DataLoaded { entities, data } => Some((entities, data)),
            _ => None,
        })
        .collect();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].0, 1);
    assert_eq!(loaded[0].1[0][0].data[0].value, json!(10));
    assert_eq!(loaded[1].0, 2);
}

#[tokio::test]
async fn test_reconnect_refreshes_realtime_window_and_resends() {
    let refreshed = SubscriptionTimewindow::realtime(
        30_000,
        60_000,
        AggregationParams {
            interval: 1_000,
            limit: 1_000,
            ..Default::default()
        },
    )
    .with_ts_offset(15);
    let options = SubscriptionOptions::new(
        DatasourceType::Entity,
        WidgetType::Timeseries,
        vec![SubscriptionDataKey::timeseries("temperature")],
    )
    .with_timewindow(realtime(1_000, AggregationType::None));
    let listener = RecordingListener::new().with_refresh(refreshed);
    let mut h = harness(options, listener).await;

    let _initial = h.subscription.subscribe();
    h.subscription.on_event(snapshot(vec![entity("E1")]));
    h.subscription.start();
    h.subscription.on_event(SubscriberEvent::Reconnect);

    assert!(h
        .listener
        .calls()
        .contains(&ListenerCall::RealtimeRefreshRequested));

    let calls = h.subscriber.calls();
    let cmd_id = match &calls[0] {
        TransportCall::Subscribe(cmds) => cmds[0].cmd_id(),
        other => panic!("expected subscribe, got {:?}", other),
    };
    assert!(calls.contains(&TransportCall::SetTsOffset(15)));
    match calls.last() {
        Some(TransportCall::Update(cmds)) => {
            assert_eq!(cmds.len(), 1);
            assert_eq!(cmds[0].cmd_id(), cmd_id);
            match &cmds[0] {
                WsCommand::EntityData(cmd) => {
                    let ts_cmd = cmd.ts_cmd.as_ref().expect("resent command carries a ts_cmd");
                    assert_eq!((ts_cmd.start_ts, ts_cmd.time_window), (30_000, 60_000));
                }
                other => panic!("expected entity data command, got {:?}", other),
            }
        }
        other => panic!("expected update, got {:?}", other),
    }

    // The aggregator now runs on [30_000, 90_000]: the sample at 20_000 fell
    // out of the refreshed window although the old one still covered it.
    let before = h.listener.updates().len();
    h.subscription.on_event(update(vec![entity("E1").with_timeseries(
        "temperature",
        series(&[(20_000, "1"), (31_000, "2")]),
    )]));
    let updates = h.listener.updates();
    assert_eq!(updates.len(), before + 1);
    assert_eq!(updates[before], (0, 0, vec![(31_000, json!(2))]));
}

#[tokio::test]
async fn test_reconnect_before_start_resends_initial_query() {
    let options = latest_widget(vec![SubscriptionDataKey::attribute("temperature")]);
    let mut h = harness(options, RecordingListener::new()).await;

    let _initial = h.subscription.subscribe();
    h.subscription.on_event(SubscriberEvent::Reconnect);

    let calls = h.subscriber.calls();
    assert_eq!(calls.len(), 2);
    match (&calls[0], &calls[1]) {
        (TransportCall::Subscribe(first), TransportCall::Update(resent)) => {
            assert_eq!(first, resent);
        }
        other => panic!("unexpected transport calls {:?}", other),
    }
    assert!(h.listener.calls().is_empty());
}
