//! VISION Master Node - server entry point.

use std::sync::Arc;

use vision_master::alerts::AlertService;
use vision_master::analytics::AnalyticsService;
use vision_master::camera_registry::CameraRegistry;
use vision_master::detector::RemoteDetector;
use vision_master::frame_cache::{FrameCache, FrameCacheConfig};
use vision_master::ingest::{PipelineCoordinator, PipelineStages};
use vision_master::matcher::CrossCameraMatcher;
use vision_master::push_fabric::{PushFabric, PushFabricConfig};
use vision_master::reid::HsvHistogramEncoder;
use vision_master::state::{AppConfig, AppState};
use vision_master::storage::{self, PipelineStore};
use vision_master::web_api;
use vision_master::zones::ZoneService;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vision_master=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting VISION Master Node v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        database_url = %config.database_url,
        detector_url = %config.detector_url,
        "Configuration loaded"
    );

    // Fatal init: database open and schema
    let pool = storage::create_pool(&config.database_url).await?;
    storage::init_schema(&pool).await?;
    tracing::info!("Database connected");

    // Components
    let cameras = Arc::new(CameraRegistry::new(pool.clone()).await?);
    let zones = Arc::new(ZoneService::new(pool.clone()).await?);
    let analytics = Arc::new(AnalyticsService::new(
        pool.clone(),
        config.pipeline.write_buf_max,
    ));
    let alerts = Arc::new(AlertService::new(pool.clone()));
    let frame_cache = Arc::new(FrameCache::new(FrameCacheConfig {
        capacity: config.pipeline.frame_cache_capacity,
        ttl: config.pipeline.frame_cache_ttl,
    }));
    let push = Arc::new(PushFabric::new(PushFabricConfig {
        buffer_capacity: config.pipeline.push_buffer_capacity,
        max_consecutive_drops: config.pipeline.push_max_consecutive_drops,
    }));

    let matcher = Arc::new(CrossCameraMatcher::new(
        pool.clone(),
        config.pipeline.match_similarity_threshold,
        config.pipeline.match_time_window,
    ));
    matcher.start();

    let detector = Arc::new(RemoteDetector::new(&config.detector_url, &config.pipeline));
    if !detector.health_check().await {
        tracing::warn!(
            detector_url = %config.detector_url,
            "Detector sidecar unreachable at startup, cameras will degrade until it appears"
        );
    }

    let coordinator = Arc::new(PipelineCoordinator::new(
        PipelineStages {
            detector,
            encoder: Arc::new(HsvHistogramEncoder::new()),
            store: PipelineStore::new(pool.clone()),
            cameras: cameras.clone(),
            zones: zones.clone(),
            analytics: analytics.clone(),
            alerts: alerts.clone(),
            frame_cache: frame_cache.clone(),
            matcher: matcher.clone(),
            push: push.clone(),
        },
        config.pipeline.clone(),
    ));

    // Periodic frame-cache sweep so idle cameras do not pin memory
    let sweep_cache = frame_cache.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            sweep_cache.evict_expired().await;
        }
    });

    let state = AppState {
        pool,
        config: config.clone(),
        cameras,
        coordinator: coordinator.clone(),
        zones,
        analytics,
        alerts,
        frame_cache,
        matcher,
        push,
    };

    let app = web_api::create_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C / SIGTERM, then stop the pipeline workers.
async fn shutdown_signal(coordinator: Arc<PipelineCoordinator>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    coordinator.shutdown();
}
