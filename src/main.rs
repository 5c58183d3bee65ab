use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use http::{
    Method,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use tokio::net::TcpListener;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use anyhow::anyhow;

use lumen_gateway::core::asr::DisabledAsrBackend;
use lumen_gateway::core::tts::SilentTtsBackend;
use lumen_gateway::pipeline::EchoPipeline;
use lumen_gateway::{AppState, GatewayConfig, handlers, routes};

/// Lumen Gateway - real-time device gateway
#[derive(Parser, Debug)]
#[command(name = "lumen-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Crypto provider must be installed before any TLS usage.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();
    let config = if let Some(config_path) = cli.config {
        println!("Loading configuration from {}", config_path.display());
        GatewayConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        GatewayConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    let address = config.address();
    let tls_config = config.server.tls.clone();
    let is_tls_enabled = config.is_tls_enabled();
    let rate_limit_rps = config.server.rate_limit_requests_per_second;
    let rate_limit_burst = config.server.rate_limit_burst_size;
    let cors_origins = config.server.cors_allowed_origins.clone();
    let files_dir = config.media.files_dir.clone();
    println!("Starting server on {address}");

    // The recognition/synthesis/reply collaborators are injected here;
    // the defaults keep the gateway runnable without any of them wired.
    let app_state = AppState::new(
        config,
        Arc::new(DisabledAsrBackend),
        Arc::new(SilentTtsBackend),
        Arc::new(EchoPipeline),
    );
    app_state.spawn_sweeps();

    // Admin REST routes behind the auth middleware.
    let protected_routes = routes::api::create_api_router().layer(middleware::from_fn_with_state(
        app_state.clone(),
        lumen_gateway::middleware::admin_auth_middleware,
    ));

    // Device WebSocket route (devices authenticate in-protocol via register).
    let ws_routes = routes::ws::create_ws_router();

    // Public health check and device-generated media.
    let public_routes = Router::new()
        .route("/health", axum::routing::get(handlers::api::health_check))
        .nest_service("/files", ServeDir::new(files_dir));

    // Rate limiting applies to the REST surface only.
    let governor_layer = if rate_limit_rps < 100_000 {
        let governor_config = GovernorConfigBuilder::default()
            .per_second(rate_limit_rps as u64)
            .burst_size(rate_limit_burst)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("Failed to build rate limiter config");
        Some(GovernorLayer::new(governor_config))
    } else {
        println!("Rate limiting disabled (rate >= 100000/s)");
        None
    };

    let cors_layer = if let Some(ref origins) = cors_origins {
        if origins == "*" {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([AUTHORIZATION, CONTENT_TYPE])
                .allow_credentials(false)
        } else {
            let origins: Vec<_> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([AUTHORIZATION, CONTENT_TYPE])
                .allow_credentials(true)
        }
    } else {
        info!("CORS not configured, defaulting to same-origin only");
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE])
            .allow_credentials(false)
    };

    let security_headers = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_CONTENT_TYPE_OPTIONS,
            http::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_FRAME_OPTIONS,
            http::HeaderValue::from_static("DENY"),
        ));

    let app = public_routes
        .merge(protected_routes)
        .merge(ws_routes)
        .with_state(app_state)
        .layer(cors_layer)
        .layer(tower::util::option_layer(governor_layer))
        .layer(security_headers);

    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    if is_tls_enabled {
        let tls = tls_config.expect("TLS config must be present when TLS is enabled");
        let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to load TLS certificates from {} and {}: {}",
                    tls.cert_path.display(),
                    tls.key_path.display(),
                    e
                )
            })?;

        println!("Server listening on https://{} (TLS enabled)", socket_addr);
        axum_server::bind_rustls(socket_addr, rustls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| anyhow!("TLS server error: {}", e))?;
    } else {
        println!("Server listening on http://{}", socket_addr);
        let listener = TcpListener::bind(&socket_addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
    }

    Ok(())
}
