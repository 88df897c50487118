use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::{Body as AxumBody, to_bytes},
    extract::{ConnectInfo, Request},
    http::{StatusCode, header},
    response::Response,
};
use http_body_util::LengthLimitError;
use tower_http::trace::TraceLayer;

use crate::core::{GatewayRequest, GatewayService};

/// Largest inbound body the gateway buffers before dispatch.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Listener-side adapter: turns axum requests into [`GatewayRequest`]s and
/// gateway responses back into axum responses.
#[derive(Clone)]
pub struct HttpHandler {
    gateway: GatewayService,
    max_body_bytes: usize,
}

impl HttpHandler {
    pub fn new(gateway: GatewayService) -> Self {
        Self {
            gateway,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn gateway(&self) -> &GatewayService {
        &self.gateway
    }

    /// Buffer the inbound request and run it through the gateway.
    pub async fn handle_request(
        &self,
        req: Request,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let (parts, body) = req.into_parts();

        let body = match to_bytes(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!("Rejecting {} {}: {}", parts.method, parts.uri, e);
                let source = e.into_inner();
                return if source.downcast_ref::<LengthLimitError>().is_some() {
                    error_response(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "payload_too_large",
                        "Payload Too Large",
                    )
                } else {
                    error_response(
                        StatusCode::BAD_REQUEST,
                        "invalid_request_body",
                        "Failed to read request body",
                    )
                };
            }
        };

        let request = GatewayRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            remote_addr: client_addr,
        };

        self.gateway.handle(request).await.map(AxumBody::from)
    }
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response<AxumBody> {
    let body = serde_json::json!({
        "error": error,
        "message": message,
    });
    let mut response = Response::new(AxumBody::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Router sending every path and method to `handler`. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the caller's
/// address reaches the pipeline.
pub fn router(handler: Arc<HttpHandler>) -> Router {
    Router::new()
        .fallback(move |req: Request| {
            let handler = Arc::clone(&handler);
            async move {
                let client_addr = req
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| *addr);
                handler.handle_request(req, client_addr).await
            }
        })
        .layer(TraceLayer::new_for_http())
}
