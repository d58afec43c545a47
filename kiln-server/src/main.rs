use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use clap::Parser;
use kiln_core::{DeploymentConfig, GenerationEngine, ModelIdentity, Session};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod engine;

use engine::TestPatternEngine;

#[derive(Parser, Debug)]
#[command(author, version, about = "Kiln image generation server")]
struct Args {
    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Fixed model id for single-model deployments
    #[arg(long)]
    model_id: Option<String>,

    /// Directory for model weights and adapter artifacts
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// Disallow fetching missing model artifacts at request time
    #[arg(long)]
    no_downloads: bool,

    /// Enable the dreambooth training capability
    #[arg(long)]
    dreambooth: bool,
}

struct AppState {
    // One request in flight at a time: the session's state transitions are
    // only correct under a single writer.
    session: Mutex<Session>,
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Handle one inference call. The body is newline-delimited JSON: ~1 Hz
/// status records while generation is in flight, then the final response as
/// the last line.
async fn inference_handler(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<Value>,
) -> impl IntoResponse {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);

    tokio::spawn(async move {
        let response = {
            let mut session = state.session.lock().await;
            session.handle(raw, Some(line_tx.clone())).await
        };
        let final_line = match serde_json::to_string(&response) {
            Ok(line) => line + "\n",
            Err(e) => {
                error!(error = %e, "response serialization failed");
                "{}\n".to_string()
            }
        };
        let _ = line_tx.send(final_line).await;
    });

    let body = Body::from_stream(async_stream::stream! {
        while let Some(line) = line_rx.recv().await {
            yield Ok::<_, std::convert::Infallible>(Bytes::from(line));
        }
    });
    ([(header::CONTENT_TYPE, "application/x-ndjson")], body)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let engine = Arc::new(TestPatternEngine::new(args.models_dir.clone()));
    let config = DeploymentConfig {
        model_id: args.model_id.clone(),
        models_dir: args.models_dir,
        runtime_downloads: !args.no_downloads,
        use_dreambooth: args.dreambooth,
    };

    // Fixed deployments expect their weights present before the first
    // request, the same way a baked container image would ship them.
    if let Some(model_id) = &config.model_id {
        let identity = ModelIdentity::new(model_id.clone());
        if !engine.is_downloaded(&identity) {
            info!(model = %identity, "materializing fixed model at startup");
            engine.download(&identity)?;
        }
    }

    let session = Session::new(engine, config);
    let state = Arc::new(AppState {
        session: Mutex::new(session),
    });

    let app = Router::new()
        .route("/", post(inference_handler))
        .route("/healthz", get(healthz))
        .with_state(state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
