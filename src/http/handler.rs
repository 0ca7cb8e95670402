//! Module registry routes and request handlers.
//!
//! Routes:
//! - `GET /.well-known/terraform.json`                                   - service discovery
//! - `GET /v1/modules/:namespace/:name/:system/versions`                 - available versions
//! - `GET /v1/modules/:namespace/:name/:system/:version/download`        - `X-Terraform-Get` pointer
//! - `GET /v1/modules/:namespace/:name/:system/:version/proxy`           - rewritten archive
//!
//! Routes live in the crate's own [`Router`]; axum only provides the
//! connection handling, the token middleware and a single fallback that
//! dispatches through it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinError;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, instrument, warn};

use crate::auth::token_middleware;
use crate::context::RequestContext;
use crate::metrics::MetricsRegistry;
use crate::repository::{ModuleCoordinate, Repository, RepositoryError};
use crate::router::{Params, RouteError, Router};

/// Capacity of the pipe between a download and the response body.
const PIPE_CAPACITY: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Discovery,
    Versions,
    Download,
    Proxy,
}

impl Endpoint {
    fn name(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Versions => "versions",
            Self::Download => "download",
            Self::Proxy => "proxy",
        }
    }
}

/// Build the registry's route table.
pub fn module_routes() -> Result<Router<Endpoint>, RouteError> {
    let mut routes = Router::new();
    routes.insert(
        Method::GET,
        "/.well-known/terraform.json",
        Endpoint::Discovery,
    )?;
    routes.insert(
        Method::GET,
        "/v1/modules/:namespace/:name/:system/versions",
        Endpoint::Versions,
    )?;
    routes.insert(
        Method::GET,
        "/v1/modules/:namespace/:name/:system/:version/download",
        Endpoint::Download,
    )?;
    routes.insert(
        Method::GET,
        "/v1/modules/:namespace/:name/:system/:version/proxy",
        Endpoint::Proxy,
    )?;
    Ok(routes)
}

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

/// State shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn Repository>,
    pub routes: Arc<Router<Endpoint>>,
    pub metrics: MetricsRegistry,
    /// Absolute base for download pointers, without a trailing slash.
    pub public_url: Option<String>,
}

impl AppState {
    pub fn new(
        repository: Arc<dyn Repository>,
        metrics: MetricsRegistry,
        public_url: Option<&str>,
    ) -> Result<Self, RouteError> {
        Ok(Self {
            repository,
            routes: Arc::new(module_routes()?),
            metrics,
            public_url: public_url.map(|url| url.trim_end_matches('/').to_string()),
        })
    }
}

/// Build the axum service for the registry listener.
pub fn create_router(state: AppState, handler_timeout: Duration) -> axum::Router {
    axum::Router::new()
        .fallback(dispatch)
        .layer(axum::middleware::from_fn_with_state(
            handler_timeout,
            token_middleware,
        ))
        .with_state(state)
}

/// Resolve the request against the route table and run the matching
/// handler.
async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let Some(matched) = state.routes.at(request.method(), request.uri().path()) else {
        debug!(method = %request.method(), path = request.uri().path(), "no route");
        return AppError::NotFound.into_response();
    };
    let endpoint = *matched.handler;
    let params = matched.params;

    let ctx = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();

    state.metrics.metrics.record_request(endpoint.name());

    let result = match endpoint {
        Endpoint::Discovery => Ok(handle_discovery()),
        Endpoint::Versions => match module_coordinate(&params) {
            Ok(coordinate) => handle_versions(&state, &ctx, coordinate).await,
            Err(e) => Err(e),
        },
        Endpoint::Download => match module_coordinate(&params)
            .and_then(|coordinate| Ok((coordinate, path_param(&params, "version")?)))
        {
            Ok((coordinate, version)) => handle_download(&state, &coordinate, version),
            Err(e) => Err(e),
        },
        Endpoint::Proxy => match module_coordinate(&params)
            .and_then(|coordinate| Ok((coordinate, path_param(&params, "version")?)))
        {
            Ok((coordinate, version)) => {
                handle_proxy(&state, ctx, coordinate, version.to_string()).await
            }
            Err(e) => Err(e),
        },
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct VersionsResponse {
    modules: Vec<ModuleVersions>,
}

#[derive(Debug, Serialize)]
struct ModuleVersions {
    versions: Vec<VersionEntry>,
}

#[derive(Debug, Serialize)]
struct VersionEntry {
    version: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /.well-known/terraform.json`
fn handle_discovery() -> Response {
    Json(serde_json::json!({ "modules.v1": "/v1/modules" })).into_response()
}

/// `GET /v1/modules/:namespace/:name/:system/versions`
#[instrument(skip_all, fields(coordinate = %coordinate))]
async fn handle_versions(
    state: &AppState,
    ctx: &RequestContext,
    coordinate: ModuleCoordinate,
) -> Result<Response, AppError> {
    let versions = state.repository.list_versions(ctx, &coordinate).await?;
    debug!(count = versions.len(), "listed versions");

    let body = VersionsResponse {
        modules: vec![ModuleVersions {
            versions: versions
                .into_iter()
                .map(|version| VersionEntry { version })
                .collect(),
        }],
    };
    Ok(Json(body).into_response())
}

/// `GET /v1/modules/:namespace/:name/:system/:version/download`
///
/// Points the client at the proxy endpoint.  No upstream call is made.
fn handle_download(
    state: &AppState,
    coordinate: &ModuleCoordinate,
    version: &str,
) -> Result<Response, AppError> {
    let location = format!(
        "{}/v1/modules/{}/{}/{}/{version}/proxy?archive=tar.gz",
        state.public_url.as_deref().unwrap_or(""),
        coordinate.repo,
        coordinate.module,
        coordinate.system,
    );
    let location = HeaderValue::from_str(&location)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid download location: {e}")))?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    response.headers_mut().insert("X-Terraform-Get", location);
    Ok(response)
}

/// `GET /v1/modules/:namespace/:name/:system/:version/proxy`
///
/// Runs the download in a task writing into a bounded pipe that backs the
/// response body.  Errors raised before the first byte is available turn
/// into a proper status; later errors abort the body.
#[instrument(skip_all, fields(coordinate = %coordinate, %version))]
async fn handle_proxy(
    state: &AppState,
    ctx: RequestContext,
    coordinate: ModuleCoordinate,
    version: String,
) -> Result<Response, AppError> {
    state
        .metrics
        .metrics
        .record_download(&coordinate.repo, &coordinate.module, &version);

    // Dropping the response body cancels the download.
    let cancel_on_drop = ctx.cancellation().clone().drop_guard();

    let (reader, mut writer) = tokio::io::duplex(PIPE_CAPACITY);
    let repository = Arc::clone(&state.repository);
    let mut task = tokio::spawn(async move {
        repository
            .proxy_download(&ctx, &coordinate, &version, &mut writer)
            .await
    });

    let mut reader = BufReader::with_capacity(PIPE_CAPACITY, reader);
    // `Some` once the download has finished, `None` while bytes are flowing.
    let finished = tokio::select! {
        biased;
        result = &mut task => Some(result),
        filled = reader.fill_buf() => match filled {
            Ok(buf) if !buf.is_empty() => None,
            _ => Some((&mut task).await),
        },
    };

    let body = match finished {
        Some(result) => {
            flatten_join(result)?;
            drop(cancel_on_drop);
            Body::from_stream(ReaderStream::new(reader))
        }
        None => {
            let tail = futures::stream::once(async move {
                let result = flatten_join(task.await);
                drop(cancel_on_drop);
                result.err().map(|e| {
                    warn!(error = %e, "download failed after streaming started");
                    Err(io::Error::other(e))
                })
            })
            .filter_map(futures::future::ready);
            Body::from_stream(ReaderStream::new(reader).chain(tail))
        }
    };

    Ok(([(header::CONTENT_TYPE, "application/gzip")], body).into_response())
}

fn flatten_join(
    result: Result<Result<(), RepositoryError>, JoinError>,
) -> Result<(), RepositoryError> {
    result.unwrap_or_else(|e| Err(RepositoryError::Internal(format!("download task failed: {e}"))))
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Coordinate addressed by the `:namespace/:name/:system` path parameters.
fn module_coordinate(params: &Params) -> Result<ModuleCoordinate, AppError> {
    let namespace = path_param(params, "namespace")?;
    let name = path_param(params, "name")?;
    let system = path_param(params, "system")?;
    Ok(ModuleCoordinate::new(system, namespace, name))
}

fn path_param<'a>(params: &'a Params, name: &str) -> Result<&'a str, AppError> {
    let value = params.get(name).ok_or(AppError::NotFound)?;
    validate_path_segment(value, name)?;
    Ok(value)
}

/// Reject anything that could change the meaning of an upstream URL or a
/// store path.
pub(crate) fn validate_path_segment(segment: &str, label: &str) -> Result<(), AppError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0', '%'])
    {
        debug!(label, segment, "rejected path segment");
        return Err(AppError::NotFound);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// No route, or a path parameter that failed validation.
    NotFound,
    /// A repository call failed.
    Repository(RepositoryError),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        AppError::Repository(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            AppError::Repository(err) => repository_error_response(err),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}

/// Upstream rejections are passed through verbatim; everything else gets a
/// generic body.
fn repository_error_response(err: RepositoryError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::BAD_GATEWAY);
    if err.is_retryable() {
        warn!(error = %err, %status, "request failed");
    } else if status.is_server_error() {
        error!(error = %err, %status, "request failed");
    } else {
        debug!(error = %err, %status, "request rejected");
    }

    let body = match err {
        RepositoryError::Forbidden => "not a valid repository".to_string(),
        RepositoryError::Upstream { body, .. } => body,
        _ => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_ascii_lowercase(),
    };
    (status, body).into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
