//! HTTP API over the [`Manager`]
//!
//! All endpoints are `GET`. Mutations without a body answer `204 No Content`;
//! failures answer `{"code": ..., "message": ...}` with the status of the
//! error kind.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::TundlerError;
use crate::manager::{Manager, ProviderInfo};
use crate::provider::Status;

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
}

/// API error response
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Wrapper for API errors to implement IntoResponse
pub struct ApiError(TundlerError);

impl From<TundlerError> for ApiError {
    fn from(err: TundlerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        debug!("Request failed ({}): {}", status, self.0);

        let body = Json(ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

/// Query parameters accepted by the provider endpoints
///
/// `provider`/`location` name one value; `providers`/`locations` take a
/// comma-separated list. The singular form wins when both are given.
#[derive(Debug, Default, Deserialize)]
pub struct Selection {
    pub provider: Option<String>,
    pub providers: Option<String>,
    pub location: Option<String>,
    pub locations: Option<String>,
}

fn split_csv(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn pick(single: Option<&str>, list: Option<&str>) -> String {
    match single.map(str::trim).filter(|s| !s.is_empty()) {
        Some(value) => value.to_string(),
        None => split_csv(list)
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default(),
    }
}

impl Selection {
    /// Every named provider; empty means "all"
    pub fn provider_names(&self) -> Vec<String> {
        match self.provider.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => vec![name.to_string()],
            None => split_csv(self.providers.as_deref()),
        }
    }

    pub fn pick_provider(&self) -> String {
        pick(self.provider.as_deref(), self.providers.as_deref())
    }

    pub fn pick_location(&self) -> String {
        pick(self.location.as_deref(), self.locations.as_deref())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvidersResponse {
    pub providers: BTreeMap<String, ProviderInfo>,
}

async fn list_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        providers: state.manager.list().await,
    })
}

async fn list_locations(State(state): State<AppState>) -> Json<BTreeMap<String, Vec<String>>> {
    Json(state.manager.locations().await)
}

async fn login(
    State(state): State<AppState>,
    Query(selection): Query<Selection>,
) -> Result<StatusCode, ApiError> {
    let names = selection.provider_names();
    if names.is_empty() {
        state.manager.login("").await?;
    }
    for name in &names {
        state.manager.login(name).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn logout(
    State(state): State<AppState>,
    Query(selection): Query<Selection>,
) -> Result<StatusCode, ApiError> {
    let names = selection.provider_names();
    if names.is_empty() {
        state.manager.logout("").await?;
    }
    for name in &names {
        state.manager.logout(name).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn connect(
    State(state): State<AppState>,
    Query(selection): Query<Selection>,
) -> Result<Json<Status>, ApiError> {
    let provider = selection.pick_provider();
    let location = selection.pick_location();
    Ok(Json(state.manager.connect(&provider, &location).await?))
}

async fn disconnect(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.manager.disconnect().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn status(State(state): State<AppState>) -> Result<Json<Status>, ApiError> {
    Ok(Json(state.manager.status().await?))
}

/// Build the router with request tracing
pub fn router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/", get(list_providers))
        .route("/locations", get(list_locations))
        .route("/login", get(login))
        .route("/logout", get(logout))
        .route("/connect", get(connect))
        .route("/disconnect", get(disconnect))
        .route("/status", get(status))
        .with_state(AppState { manager })
        .layer(TraceLayer::new_for_http())
}
