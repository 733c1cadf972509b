use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;

use crate::perms::types::{CheckRequest, CheckResponse, MetaRequest, MetaResponse};
use crate::perms::PermissionEngine;
use crate::settings::Settings;

/// Read API over the resolver. Remote deployments point their authority at it.
pub fn router(engine: Arc<PermissionEngine>) -> Router {
    Router::new()
        .route("/v1/check", post(handle_check))
        .route("/v1/meta", post(handle_meta))
        .route("/healthz", get(health))
        .with_state(engine)
}

pub async fn serve(settings: &Settings, engine: Arc<PermissionEngine>) -> miette::Result<()> {
    let addr: SocketAddr = settings
        .listen_addr()
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    tracing::info!(%addr, "Permission API listening");

    axum::serve(listener, router(engine)).await.into_diagnostic()?;
    Ok(())
}

async fn handle_check(
    State(engine): State<Arc<PermissionEngine>>,
    Json(req): Json<CheckRequest>,
) -> impl IntoResponse {
    let allowed = engine
        .resolver()
        .has_permission(req.identity, &req.permission)
        .await;
    Json(CheckResponse { allowed })
}

async fn handle_meta(
    State(engine): State<Arc<PermissionEngine>>,
    Json(req): Json<MetaRequest>,
) -> impl IntoResponse {
    let resolver = engine.resolver();
    Json(MetaResponse {
        prefix: resolver.get_prefix(req.identity).await,
        suffix: resolver.get_suffix(req.identity).await,
        primary_group: resolver.get_primary_group(req.identity).await,
    })
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
