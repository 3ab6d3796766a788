//! # Request Logging Middleware
//!
//! Logs the start and end of every request inside a `tracing` span that
//! carries a correlation id. The id is taken from the client's
//! `X-Correlation-ID` header when present, generated otherwise, and echoed
//! back on the response so client and server logs can be joined.
//!
//! ## Log Fields:
//! - `correlation_id`, `method`, `uri`, `remote_addr` on every line
//! - `status` and `duration_ms` on completion

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error, HttpMessage,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{error, info, Instrument};
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Correlation id of the current request, stored in request extensions.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

/// Client-supplied ids are accepted only if short and printable.
fn incoming_correlation_id(req: &ServiceRequest) -> Option<String> {
    req.headers()
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= 128)
        .map(str::to_string)
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let correlation_id = incoming_correlation_id(&req).unwrap_or_else(|| Uuid::new_v4().to_string());
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let remote_addr = req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string();

        req.extensions_mut().insert(CorrelationId(correlation_id.clone()));

        let span = tracing::info_span!("request", correlation_id = %correlation_id);
        let fut = {
            let _entered = span.enter();
            info!(method = %method, uri = %uri, remote_addr = %remote_addr, "Request started");
            self.service.call(req)
        };

        Box::pin(
            async move {
                let mut result = fut.await;
                let duration_ms = start_time.elapsed().as_millis() as u64;

                match &mut result {
                    Ok(response) => {
                        info!(
                            method = %method,
                            uri = %uri,
                            status = response.status().as_u16(),
                            duration_ms,
                            "Request completed"
                        );
                        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
                            response
                                .headers_mut()
                                .insert(HeaderName::from_static(CORRELATION_HEADER), value);
                        }
                    }
                    Err(err) => {
                        error!(method = %method, uri = %uri, duration_ms, error = %err, "Request failed");
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}
