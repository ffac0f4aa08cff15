use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::config::Config;
use crate::handlers::{
    cleanup_upload, complete_upload, download_file, file_info, get_status, health_check,
    init_session, list_files, progress_events, room_events, room_state, upload_chunk,
};
use crate::middleware::add_security_headers;
use crate::state::AppState;
use crate::utils::shutdown_signal;

/// build the application router
pub fn build_router(state: Arc<AppState>, config: &Config) -> Router {
    tracing::debug!(
        "Building router with max upload size: {} bytes",
        config.max_upload_size
    );

    Router::new()
        .merge(session_routes(config))
        .route("/health", get(health_check))
        .route("/upload/:upload_id/:idx", put(upload_chunk))
        .route("/status/:upload_id", get(get_status))
        .route("/complete/:upload_id", post(complete_upload))
        .route("/cleanup/:upload_id", delete(cleanup_upload))
        .route("/events/:upload_id", get(progress_events))
        .route("/room/:share_id", get(room_state))
        .route("/room/:share_id/events", get(room_events))
        .route("/files", get(list_files))
        .route("/file/:upload_id", get(file_info))
        .route("/download/:upload_id/:filename", get(download_file))
        // the limit layer below owns body size, not axum's 2MB default
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_size))
        .layer(axum::middleware::from_fn(add_security_headers))
        .layer(CompressionLayer::new().gzip(true).br(true).zstd(true))
        .layer(cors_layer(config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// session creation, rate limited per client ip when enabled
fn session_routes(config: &Config) -> Router<Arc<AppState>> {
    let router = Router::new().route("/init", post(init_session));
    if config.rate_limit_per_minute == 0 {
        return router;
    }

    let per_request_ms = (60_000 / config.rate_limit_per_minute).max(1);
    let burst = u32::try_from(config.rate_limit_per_minute).unwrap_or(u32::MAX);
    match GovernorConfigBuilder::default()
        .per_millisecond(per_request_ms)
        .burst_size(burst)
        .finish()
    {
        Some(governor_conf) => router.layer(GovernorLayer {
            config: Arc::new(governor_conf),
        }),
        None => {
            tracing::warn!("⚠️  Invalid rate limit configuration, session creation is unlimited");
            router
        }
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    if config.cors_origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

/// run the server until a shutdown signal arrives
pub async fn start_server(app: Router, addr: SocketAddr) -> std::io::Result<()> {
    tracing::info!("Starting server...");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!("Listener bound to {}", addr);

    tracing::info!("Server running and ready to accept connections");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .tcp_nodelay(true)
    .await
}

/// print startup banner with server info
pub fn print_startup_banner(config: &Config) {
    tracing::info!("aetherdrop starting...");
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("📡 TRANSFER SERVER: http://{}:{}", config.host, config.port);
    tracing::info!(
        "📁 Storing uploads in: {:?}",
        config
            .storage_root
            .canonicalize()
            .unwrap_or(config.storage_root.clone())
    );
    tracing::info!(
        "⏱️  Room expiry: {}h, heartbeat every {}s",
        config.room_expiry.as_secs() / 3600,
        config.heartbeat_interval.as_secs()
    );
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
