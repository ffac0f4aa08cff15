use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use aetherdrop::config::Config;
use aetherdrop::server::{build_router, print_startup_banner, start_server};
use aetherdrop::state::AppState;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> ExitCode {
    // load .env file if it exists (fails silently if not found)
    let _ = dotenvy::dotenv();

    // before reading config so warnings about bad values are visible
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("❌ Failed to build Tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        if let Err(e) = run(config).await {
            tracing::error!("❌ {}", e);
            return ExitCode::FAILURE;
        }
        ExitCode::SUCCESS
    })
}

async fn run(config: Config) -> Result<(), String> {
    if !config.storage_root.exists() {
        tokio::fs::create_dir_all(&config.storage_root)
            .await
            .map_err(|e| format!("failed to create storage root {:?}: {}", config.storage_root, e))?;
        tracing::info!("Created storage root at: {:?}", config.storage_root);
    }

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid HOST {:?}", config.host))?;
    let addr = SocketAddr::from((host, config.port));

    let state = Arc::new(AppState::new(&config));
    let app = build_router(state, &config);

    print_startup_banner(&config);

    start_server(app, addr)
        .await
        .map_err(|e| format!("server error on {}: {}", addr, e))?;
    tracing::info!("Server stopped");
    Ok(())
}
