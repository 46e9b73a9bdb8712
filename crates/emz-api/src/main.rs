//! Local HTTP message surface for emz.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use clap::{Args, Parser};
use log::info;
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use emz_core::{
    AppConfig, AppPaths, InboundMessage, JsonFileStorage, Orchestrator, ProcessUpdate,
    ProcessingState, UploadResult, UploadSettings,
};

type SharedOrchestrator = Orchestrator<JsonFileStorage, broadcast::Sender<ProcessUpdate>>;

fn main() -> anyhow::Result<()> {
    try_main()
}

#[tokio::main]
async fn try_main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let paths = AppPaths::discover(cli.common.config.as_deref())?;
    let config = AppConfig::load(&paths, false)?;
    let paths = paths.apply_overrides(&config)?;
    paths.ensure_directories()?;

    let (updates, receiver) = broadcast::channel(16);
    tokio::spawn(log_updates(receiver));

    let state = AppState {
        orchestrator: Arc::new(Orchestrator::new(
            JsonFileStorage::new(paths.storage_file())
                .with_lock_file(paths.storage_lock_file()),
            updates,
            UploadSettings::from(&config),
        )),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.common.port));
    info!("Starting API server on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Local HTTP message surface for emz")]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<SharedOrchestrator>,
}

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/messages", post(post_message))
        .route("/state", get(get_state))
        .with_state(state)
}

async fn log_updates(mut receiver: broadcast::Receiver<ProcessUpdate>) {
    loop {
        match receiver.recv().await {
            Ok(update) if update.success => {
                info!("processUpdate: {}", update.status.as_deref().unwrap_or_default());
            }
            Ok(update) => {
                log::warn!("processUpdate failed: {}", update.error.as_deref().unwrap_or_default());
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("update log lagged, skipped {skipped} updates");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn post_message(
    State(state): State<AppState>,
    Json(message): Json<InboundMessage>,
) -> Json<UploadResult> {
    Json(state.orchestrator.handle_message(message).await)
}

async fn get_state(State(state): State<AppState>) -> Result<Json<ProcessingState>, StatusCode> {
    state
        .orchestrator
        .last_state()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use emz_core::{StatusKind, TokenSet};

    fn state_in(dir: &tempfile::TempDir) -> (AppState, broadcast::Receiver<ProcessUpdate>) {
        let (tx, rx) = broadcast::channel(4);
        let orchestrator = Orchestrator::new(
            JsonFileStorage::new(dir.path().join("storage.json")),
            tx,
            UploadSettings::default(),
        );
        (
            AppState {
                orchestrator: Arc::new(orchestrator),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn state_is_not_found_before_first_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (state, _rx) = state_in(&dir);
        let err = get_state(State(state)).await.expect_err("no state yet");
        assert_eq!(err, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_tokens_are_answered_and_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (state, mut rx) = state_in(&dir);
        let message = InboundMessage::ProcessFiles {
            files: "[]".to_string(),
            tokens: TokenSet::default(),
        };

        let Json(result) = post_message(State(state.clone()), Json(message)).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Could not find required tokens"));

        let update = rx.recv().await.expect("update broadcast");
        assert!(!update.success);
        assert_eq!(update.error.as_deref(), Some("Could not find required tokens"));

        let Json(last) = get_state(State(state)).await.expect("state persisted");
        assert_eq!(last.status, "Could not find required tokens");
        assert_eq!(last.kind, StatusKind::Error);
    }

    #[test]
    fn process_files_message_decodes_from_wire_json() {
        let message: InboundMessage = serde_json::from_str(
            r#"{"action":"processFiles","files":"[]","tokens":{"chatToken":"c","identityToken":"i","permissionsId":"t"}}"#,
        )
        .expect("decode");
        let InboundMessage::ProcessFiles { files, tokens } = message;
        assert_eq!(files, "[]");
        assert!(tokens.as_complete().is_some());
    }
}
