//! Optional shared-password gate for the web API.
//!
//! With a password configured, every request must present it through the
//! `X-Autopilot-Password` header, an `Authorization: Bearer` header, or a
//! `token` query parameter (for `EventSource`, which cannot set headers).
//! Without one, requests pass through.

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};

pub const PASSWORD_HEADER: &str = "x-autopilot-password";

// ---------------------------------------------------------------------------
// PasswordLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PasswordLayer {
    password: Option<Arc<String>>,
}

impl PasswordLayer {
    pub fn new(password: Option<String>) -> Self {
        Self {
            password: password.filter(|p| !p.is_empty()).map(Arc::new),
        }
    }
}

impl<S> Layer<S> for PasswordLayer {
    type Service = PasswordGate<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PasswordGate {
            inner,
            password: self.password.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// PasswordGate
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PasswordGate<S> {
    inner: S,
    password: Option<Arc<String>>,
}

fn presented_secret(req: &Request<Body>) -> Option<String> {
    let headers = req.headers();
    headers
        .get(PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        })
        .or_else(|| {
            req.uri().query().and_then(|q| {
                q.split('&')
                    .filter_map(|pair| pair.split_once('='))
                    .find(|(k, _)| *k == "token")
                    .map(|(_, v)| v.to_string())
            })
        })
}

impl<S> Service<Request<Body>> for PasswordGate<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let password = self.password.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(expected) = password else {
                return inner.call(req).await;
            };
            if req.uri().path() == "/api/health" {
                return inner.call(req).await;
            }

            match presented_secret(&req) {
                Some(ref secret) if bool::from(secret.as_bytes().ct_eq(expected.as_bytes())) => {
                    inner.call(req).await
                }
                _ => Ok((
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"error": "unauthorized"})),
                )
                    .into_response()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
