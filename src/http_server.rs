//! HTTP server implementation using Axum.

use crate::config::ServeConfig;
use crate::error::WorkspaceError;
use crate::reaper::Reaper;
use crate::state::{AppState, SessionToken};
use crate::variables::{VariableDeclaration, VALUES_FILE};
use crate::workspace::UploadedEntry;
use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// Request/Response types
#[derive(Serialize)]
struct CreateWorkspaceResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct RunRequest {
    #[serde(default)]
    command: String,
}

#[derive(Serialize)]
struct SessionInfo {
    id: String,
    idle_secs: u64,
}

impl IntoResponse for WorkspaceError {
    fn into_response(self) -> Response {
        let status = match &self {
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            WorkspaceError::NotFound | WorkspaceError::FileNotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Request failed");
            return (status, "Internal server error".to_string()).into_response();
        }
        (status, self.to_string()).into_response()
    }
}

/// Build the router. `max_upload` caps every request body.
pub fn router(state: AppState, max_upload: usize) -> Router {
    Router::new()
        // Workspace lifecycle
        .route("/workspaces", post(create_workspace))
        .route("/workspaces", get(list_sessions))
        .route("/workspaces/:id", delete(cleanup))
        .route("/workspaces/:id/cleanup", post(cleanup))
        .route("/workspaces/:id/heartbeat", post(heartbeat))
        // Variables
        .route("/workspaces/:id/variables", get(list_variables))
        .route("/workspaces/:id/variables", post(submit_variables))
        .route("/workspaces/:id/variables/file", get(download_variables))
        // Commands
        .route("/workspaces/:id/run", post(run_command))
        // Health check
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server and the reaper until Ctrl-C.
pub async fn run_server(config: &ServeConfig, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    let reaper = Reaper::start(
        state.workspaces.clone(),
        config.cleanup_interval(),
        config.inactivity_timeout(),
    );
    let app = router(state, config.max_content_length);

    info!("Starting HTTP server on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    reaper.stop().await;
    info!("HTTP server shut down");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn create_workspace(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<CreateWorkspaceResponse>), WorkspaceError> {
    let mut entries = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| WorkspaceError::MalformedUpload(e.body_text()))?
    {
        if field.name() != Some("files") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let content = field
            .bytes()
            .await
            .map_err(|e| WorkspaceError::MalformedUpload(e.body_text()))?;
        if name.is_empty() {
            continue;
        }
        entries.push(UploadedEntry::new(name, content.to_vec()));
    }

    let token = state.workspaces.create_with_uploads(entries).await?;
    info!("Created session: {}", token);

    Ok((
        StatusCode::CREATED,
        Json(CreateWorkspaceResponse {
            session_id: token.to_string(),
        }),
    ))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let list = state
        .workspaces
        .sessions()
        .await
        .into_iter()
        .map(|s| SessionInfo {
            id: s.token.to_string(),
            idle_secs: s.idle.as_secs(),
        })
        .collect();
    Json(list)
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, WorkspaceError> {
    let token: SessionToken = id.parse()?;
    state.workspaces.touch(&token).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn cleanup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, WorkspaceError> {
    let token: SessionToken = id.parse()?;
    state.workspaces.explicit_cleanup(&token).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_variables(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<VariableDeclaration>>, WorkspaceError> {
    let token: SessionToken = id.parse()?;
    let vars = state.workspaces.list_variables(&token).await?;
    Ok(Json(vars))
}

async fn submit_variables(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(values): Json<HashMap<String, String>>,
) -> Result<StatusCode, WorkspaceError> {
    let token: SessionToken = id.parse()?;
    state.workspaces.write_variable_values(&token, values).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn download_variables(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, WorkspaceError> {
    let token: SessionToken = id.parse()?;
    let content = state.workspaces.read_variable_values_file(&token).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{VALUES_FILE}\""),
            ),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        content,
    )
        .into_response())
}

async fn run_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Option<Json<RunRequest>>,
) -> Result<Response, WorkspaceError> {
    let token: SessionToken = id.parse()?;
    // A missing or unreadable body is an empty, and so unknown, verb.
    let command = req.map(|Json(req)| req.command).unwrap_or_default();
    info!("POST /workspaces/{}/run - command: {:?}", token, command);

    let output = state.workspaces.run_command(&token, &command).await?;
    let body = Body::from_stream(output.map(Ok::<_, Infallible>));

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        body,
    )
        .into_response())
}
