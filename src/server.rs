//! HTTP front end for [`ShapleyService`].
//!
//! Routes:
//!
//! | Method  | Path              | Body                  |
//! |---------|-------------------|-----------------------|
//! | `GET`   | `/shapley`        | raw norm id           |
//! | `PATCH` | `/bsl_norms`      | JSON norm patch       |
//! | `PATCH` | `/norms`          | JSON norm patch       |
//! | `PATCH` | `/path_length`    | raw positive integer  |
//! | `PATCH` | `/path_sample`    | raw positive integer  |
//! | `POST`  | `/shapley/inline` | JSON inline request   |
//!
//! Handlers hand the request to the service on the blocking thread pool;
//! a Shapley computation blocks its caller until every estimate finished.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::NormshapError;
use crate::model::{ModelFactory, ValueFunction};
use crate::transport::{ServiceResponse, ShapleyService, MAX_BODY_BYTES};

/// Errors of the serve loop.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or serving failed.
    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
}

type SharedService<F, V> = Arc<ShapleyService<F, V>>;

impl IntoResponse for ServiceResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body)).into_response()
    }
}

/// Builds the router over `service`.
pub fn router<F, V>(service: SharedService<F, V>) -> Router
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    Router::new()
        .route("/shapley", get(compute_stored::<F, V>))
        .route("/shapley/inline", post(compute_inline::<F, V>))
        .route("/bsl_norms", patch(patch_baseline::<F, V>))
        .route("/norms", patch(patch_current::<F, V>))
        .route("/path_length", patch(patch_path_length::<F, V>))
        .route("/path_sample", patch(patch_path_sample::<F, V>))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(service)
}

/// Binds `addr` and serves until ctrl-c.
pub async fn serve<F, V>(addr: SocketAddr, service: SharedService<F, V>) -> Result<(), ServerError>
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "normshap server listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("normshap server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

async fn blocking<F, V>(
    service: SharedService<F, V>,
    call: impl FnOnce(&ShapleyService<F, V>) -> ServiceResponse + Send + 'static,
) -> ServiceResponse
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    match tokio::task::spawn_blocking(move || call(&service)).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "request task failed");
            ServiceResponse::from_error(&NormshapError::internal(e.to_string()))
        }
    }
}

async fn compute_stored<F, V>(State(service): State<SharedService<F, V>>, body: Bytes) -> ServiceResponse
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    blocking(service, move |s| s.compute_stored(&body)).await
}

async fn compute_inline<F, V>(
    State(service): State<SharedService<F, V>>,
    headers: HeaderMap,
    body: Bytes,
) -> ServiceResponse
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    let content_type = content_type(&headers);
    blocking(service, move |s| s.compute_inline(content_type.as_deref(), &body)).await
}

async fn patch_baseline<F, V>(
    State(service): State<SharedService<F, V>>,
    headers: HeaderMap,
    body: Bytes,
) -> ServiceResponse
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    service.patch_baseline(content_type(&headers).as_deref(), &body)
}

async fn patch_current<F, V>(
    State(service): State<SharedService<F, V>>,
    headers: HeaderMap,
    body: Bytes,
) -> ServiceResponse
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    service.patch_current(content_type(&headers).as_deref(), &body)
}

async fn patch_path_length<F, V>(State(service): State<SharedService<F, V>>, body: Bytes) -> ServiceResponse
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    service.patch_path_length(&body)
}

async fn patch_path_sample<F, V>(State(service): State<SharedService<F, V>>, body: Bytes) -> ServiceResponse
where
    F: ModelFactory,
    V: ValueFunction<F::Model>,
{
    service.patch_path_sample(&body)
}
