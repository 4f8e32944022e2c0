pub mod chunker;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod sequencer;
pub mod session;
pub mod validation;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Semaphore;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use lipsync_core::RhubarbExtractor;
use llm_core::{LlmClient, LlmProvider};
use tts_core::EspeakSynthesizer;

use crate::config::ServerConfig;
use crate::pipeline::Engines;
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub engines: Arc<Engines>,
    pub sessions: Arc<SessionRegistry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting streaming speech server...");

    let config = Arc::new(ServerConfig::from_env());

    let provider = match config.llm_provider.as_str() {
        "openai" => LlmProvider::OpenAi,
        _ => LlmProvider::Ollama,
    };
    let generator = Arc::new(LlmClient::new(
        provider,
        &config.llm_base_url,
        &config.llm_model,
        config.llm_api_key.clone(),
    ));
    info!(?provider, model = %config.llm_model, "generation engine configured");

    let synthesizer = Arc::new(EspeakSynthesizer::new(
        &config.tts_voice,
        config.tts_rate_wpm,
    ));
    synthesizer
        .probe()
        .await
        .context("speech engine unavailable")?;

    let extractor = RhubarbExtractor::discover(&config.rhubarb_bin_dir)
        .context("viseme extractor unavailable")?;

    let engines = Arc::new(Engines {
        generator,
        synthesizer,
        extractor: Arc::new(extractor),
        synth_gate: Arc::new(Semaphore::new(config.synth_max_inflight)),
    });

    let state = AppState {
        config: config.clone(),
        engines,
        sessions: Arc::new(SessionRegistry::new()),
    };

    let cors = match &config.cors_allowed_origins {
        Some(origins) => {
            let parsed: Vec<_> = origins
                .iter()
                .filter_map(|origin| origin.parse::<axum::http::HeaderValue>().ok())
                .collect();
            if parsed.is_empty() {
                warn!("no parseable CORS origins, falling back to permissive CORS");
                permissive_cors()
            } else {
                info!(origins = parsed.len(), "CORS restricted");
                CorsLayer::new()
                    .allow_origin(tower_http::cors::AllowOrigin::list(parsed))
                    .allow_methods([
                        axum::http::Method::GET,
                        axum::http::Method::POST,
                        axum::http::Method::OPTIONS,
                    ])
                    .allow_headers(tower_http::cors::Any)
                    .allow_credentials(false)
            }
        }
        None => {
            warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins");
            permissive_cors()
        }
    };

    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors)
        .into_inner();

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws/chat", get(ws::ws_handler))
        .layer(middleware)
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT."))?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn permissive_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
        .allow_credentials(false)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub service: &'static str,
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "speech-pipeline-server",
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
