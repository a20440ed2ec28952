//! Home Occupancy Controller
//!
//! Main entry point: builds the application context, wires the config
//! listener chain, spawns the pipeline tasks, and blocks until ctrl-c.

use home_occupancy::{
    bus::{spawn_liveness_task, BusClient},
    cam_forwarder,
    detector::DetectorClient,
    discovery,
    image_pipeline::{spawn_image_pipeline, ImageCache},
    inspect::InspectServer,
    model::{Model, SharedModel},
    motion::spawn_normalizer,
    occupancy::spawn_state_machine,
    router::{spawn_router, stage_channels, StageReceivers},
    settings::Settings,
    state::AppContext,
    status_store::StatusStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn init_tracing(level: &str) -> FilterHandle {
    let (filter, handle) = reload::Layer::new(EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    handle
}

fn normalize_level(level: &str) -> &str {
    match level {
        "trace" | "debug" | "info" | "warn" => level,
        _ => "info",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter_handle = init_tracing("trace");
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting home occupancy controller"
    );

    let settings = Arc::new(Settings::load());

    let insecure_tls = settings.get_bool("insecure_tls");
    if insecure_tls {
        tracing::debug!("disabling tls verification");
    }
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .danger_accept_invalid_certs(insecure_tls)
        .build()?;

    let model = SharedModel::new();
    let status = Arc::new(StatusStore::new());
    let cache = Arc::new(ImageCache::new());
    let detector = Arc::new(DetectorClient::new(http.clone(), settings.clone()));
    let bus = Arc::new(BusClient::new(settings.clone()));

    let ctx = AppContext {
        settings: settings.clone(),
        bus: bus.clone(),
        model: model.clone(),
        status: status.clone(),
        cache: cache.clone(),
        detector: detector.clone(),
    };

    // feed from the bus into the router; stage channels between pipeline
    // tasks
    let (feed_tx, feed_rx) = mpsc::channel(64);
    let (stage_tx, stage_rx) = stage_channels();

    // --- config listener chain, in the order listeners must run ---

    let log_settings = settings.clone();
    let log_handle = filter_handle.clone();
    settings
        .register_listener("logger", move || {
            let level = normalize_level(&log_settings.get_string("log_level")).to_string();
            let handle = log_handle.clone();
            Box::pin(async move {
                if let Err(e) = handle.reload(EnvFilter::new(&level)) {
                    tracing::error!(error = %e, "error reloading log filter");
                }
                tracing::info!(level = %level, "logging initialized");
            })
        })
        .await;

    let model_settings = settings.clone();
    let model_handle = model.clone();
    let model_status = status.clone();
    settings
        .register_listener("model", move || {
            let settings = model_settings.clone();
            let model = model_handle.clone();
            let status = model_status.clone();
            Box::pin(async move {
                let built = Model::from_settings(&settings);
                status.sync_rooms(&built.room_names()).await;
                model.replace(built).await;
            })
        })
        .await;

    let sub_bus = bus.clone();
    let sub_model = model.clone();
    let sub_feed = feed_tx.clone();
    settings
        .register_listener("subscriptions", move || {
            let bus = sub_bus.clone();
            let model = sub_model.clone();
            let feed = sub_feed.clone();
            Box::pin(async move {
                let snapshot = model.snapshot().await;
                bus.replace_subscriptions(snapshot.subscribed_topics(), feed).await;
            })
        })
        .await;

    let mqtt_bus = bus.clone();
    settings
        .register_listener("mqtt", move || {
            let bus = mqtt_bus.clone();
            Box::pin(async move {
                if let Err(e) = bus.reinit().await {
                    // a controller that cannot reach the bus is useless
                    tracing::error!(error = %e, "bus connect failed");
                    std::process::exit(1);
                }
            })
        })
        .await;

    // re-advertise discovery records on every (re)connect
    let hook_model = model.clone();
    let hook_bus = bus.clone();
    bus.register_connect_hook(
        "haadvertise",
        Arc::new(move |_client| {
            let model = hook_model.clone();
            let bus = hook_bus.clone();
            Box::pin(async move {
                let snapshot = model.snapshot().await;
                discovery::advertise(&snapshot.rooms, &bus).await;
            })
        }),
    );

    // first run of the chain: logger, model build, subscriptions, connect
    settings.fire_all().await;

    // --- pipeline tasks ---

    let StageReceivers {
        image: image_rx,
        motion: motion_rx,
        door: door_rx,
        results: results_rx,
    } = stage_rx;

    spawn_router(feed_rx, model.clone(), stage_tx.clone());
    spawn_image_pipeline(
        image_rx,
        stage_tx.results.clone(),
        detector.clone(),
        cache.clone(),
        settings.clone(),
    );
    spawn_normalizer(motion_rx, door_rx, stage_tx.results.clone());
    spawn_state_machine(results_rx, model.clone(), status.clone(), bus.clone());

    // --- inspection server ---

    let inspect = Arc::new(InspectServer::new(ctx.clone()));
    if let Err(e) = inspect.start().await {
        tracing::error!(error = %e, "error starting inspection server");
    }
    let inspect_for_listener = inspect.clone();
    settings
        .register_listener("monitor", move || {
            let inspect = inspect_for_listener.clone();
            Box::pin(async move { inspect.restart().await })
        })
        .await;

    // --- periodic work ---

    cam_forwarder::start(&settings, http.clone(), bus.clone());
    spawn_liveness_task(bus.clone());
    discovery::spawn_advertiser(model.clone(), bus.clone());
    settings.clone().spawn_watcher();

    tracing::info!("ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
