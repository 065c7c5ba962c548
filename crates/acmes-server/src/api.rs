//! HTTP surface: `POST /obtain` and `POST /renew`
//!
//! Requests are gated in order: method, content type, body, path. Nothing
//! reaches the coordinator unless all four pass.

use acmes_cert::CertificateRecord;
use acmes_proto::{CertificateResponse, DomainRequest, ErrorResponse, Operation, ACME_CONTENT_TYPE};
use axum::{
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::{header::CONTENT_TYPE, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Json, Router,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::coordinator::{Coordinator, CoordinatorError};

/// Shared handler state
pub struct AppState {
    pub coordinator: Coordinator,
    /// Account every request is issued under
    pub email: String,
}

/// Build the router with the request gate applied to every path
pub fn build_router(state: Arc<AppState>) -> Router {
    // Paths are resolved after the body so a bad body wins over an unknown path
    Router::new()
        .fallback(dispatch)
        .layer(middleware::from_fn(require_acme_request))
        .with_state(state)
}

/// Reject anything that is not a `POST` with `Content-Type: application/acme`
async fn require_acme_request(request: Request, next: Next) -> Response {
    debug!("{} {}", request.method(), request.uri());

    if request.method() != Method::POST {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    if content_type != Some(ACME_CONTENT_TYPE) {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    next.run(request).await
}

/// Request body with a trimmed, non-empty domain
pub struct AcmeRequest(pub DomainRequest);

impl<S> FromRequest<S> for AcmeRequest
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|_| StatusCode::BAD_REQUEST)?;

        let mut request: DomainRequest =
            serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

        request.domain = request.domain.trim().to_string();
        if request.domain.is_empty() {
            return Err(StatusCode::BAD_REQUEST);
        }

        Ok(AcmeRequest(request))
    }
}

type ApiResult = Result<Json<CertificateResponse>, (StatusCode, Json<ErrorResponse>)>;

async fn dispatch(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    AcmeRequest(request): AcmeRequest,
) -> Response {
    match Operation::from_path(uri.path()) {
        Some(operation) => handle(&state, operation, &request.domain)
            .await
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle(state: &AppState, operation: Operation, domain: &str) -> ApiResult {
    let result = match operation {
        Operation::Obtain => state.coordinator.obtain(&state.email, domain).await,
        Operation::Renew => state.coordinator.renew(&state.email, domain).await,
    };

    match result {
        Ok(record) => Ok(Json(certificate_response(record))),
        Err(e) => Err(error_response(operation, domain, e)),
    }
}

fn certificate_response(record: CertificateRecord) -> CertificateResponse {
    CertificateResponse {
        resource: record.resource,
        cert: record.certificate_chain,
        key: record.private_key,
        not_after: record.not_after,
    }
}

fn error_response(
    operation: Operation,
    domain: &str,
    e: CoordinatorError,
) -> (StatusCode, Json<ErrorResponse>) {
    warn!(operation = %operation, domain = %domain, error = %e, "Request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            cause: e.to_string(),
        }),
    )
}
