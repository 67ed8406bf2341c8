use entity_data_sdk::prelude::*;
use entity_data_sdk::telemetry::{self, TelemetryConfig};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

struct PrintingListener;

impl EntityDataListener for PrintingListener {
    fn config_datasource_index(&self) -> usize {
        0
    }

    fn data_updated(
        &mut self,
        data: &DataSetHolder,
        _datasource_index: usize,
        entity_index: usize,
        key_index: usize,
        _detect_changes: bool,
        is_latest: bool,
    ) {
        let tail = data.data.last().map(|p| (p.ts, p.value.clone()));
        println!(
            "[entity {} key {}{}] {} points, last {:?}",
            entity_index,
            key_index,
            if is_latest { " latest" } else { "" },
            data.data.len(),
            tail
        );
    }

    fn data_loaded(
        &mut self,
        page_data: &PageData<EntityData>,
        _data: &[Vec<DataSetHolder>],
        _datasource_index: usize,
        _page_link: Option<&EntityDataPageLink>,
    ) {
        println!("loaded {} entities", page_data.data.len());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init(TelemetryConfig::new("function-feed"))?;

    let seconds = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<u64>().ok())
        .unwrap_or(5);

    let clock = Arc::new(SystemClock::new());
    let now = clock.wall_ms();
    let timewindow = SubscriptionTimewindow::realtime(
        now - 60_000,
        60_000,
        AggregationParams {
            interval: 1_000,
            limit: 60,
            agg_type: AggregationType::Avg,
            ..Default::default()
        },
    );

    let options = SubscriptionOptions::new(
        DatasourceType::Function,
        WidgetType::Timeseries,
        vec![
            SubscriptionDataKey::function("sine", "Math.sin(time / 5000) * 10"),
            SubscriptionDataKey::function("ramp", "prevValue + 1"),
            SubscriptionDataKey::function("ticks", "prevValue + 1").with_latest(true),
        ],
    )
    .with_timewindow(timewindow);

    let mut subscription = EntityDataSubscription::create(
        options,
        Box::new(PrintingListener),
        None,
        &ExpressionCompiler::new(),
        clock,
        SubscriptionConfig::default().with_max_tick_frequency(Duration::from_secs(1)),
    )
    .await;

    let initial = subscription.subscribe();
    let (_events_tx, events_rx) = mpsc::unbounded_channel();
    let (handle, task) = driver::spawn(subscription, events_rx);

    if let Some(loaded) = initial.await? {
        println!("initial page: {} entities", loaded.page_data.data.len());
    }
    handle.start().await?;

    sleep(Duration::from_secs(seconds)).await;
    handle.unsubscribe().await?;
    task.await?;
    Ok(())
}
