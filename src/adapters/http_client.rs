use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{DispatchError, DispatchResult, DownstreamClient};

const USER_AGENT: &str = concat!("Portico/", env!("CARGO_PKG_VERSION"));

/// Downstream client adapter using Hyper with Rustls (HTTP/1.1).
///
/// Responsibilities:
/// * Keeps a pooled connection per destination authority
/// * Buffers the whole response so body faults surface before the pipeline
///   commits to a status
/// * Distinguishes connect-phase failures from body-phase failures
/// * Performs GET based health probes with timeout
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpClientAdapter {
    /// Create a new downstream client adapter.
    pub fn new() -> Result<Self> {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("A rustls crypto provider was already installed");
        }

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build::<_, Full<Bytes>>(https_connector);

        tracing::info!("Created downstream HTTP client");
        Ok(Self { client })
    }

    /// Fill in `Host` and `User-Agent` when the request carries none.
    fn add_common_headers(req: &mut Request<Full<Bytes>>) -> DispatchResult<()> {
        let authority = req
            .uri()
            .authority()
            .map(|authority| authority.as_str().to_string())
            .ok_or_else(|| DispatchError::InvalidRequest("Outgoing URI has no host".to_string()))?;

        let headers = req.headers_mut();
        if !headers.contains_key(header::HOST) {
            let value = HeaderValue::from_str(&authority)
                .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
            headers.insert(header::HOST, value);
        }
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        }
        Ok(())
    }
}

#[async_trait]
impl DownstreamClient for HttpClientAdapter {
    async fn send(&self, req: Request<Bytes>) -> DispatchResult<Response<Bytes>> {
        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let mut outgoing = Request::from_parts(parts, Full::new(body));
        Self::add_common_headers(&mut outgoing)?;

        let method = outgoing.method().clone();
        let uri = outgoing.uri().clone();
        tracing::debug!("Sending request: {} {}", method, uri);
        tracing::trace!("Outgoing request headers: {:?}", outgoing.headers());

        let response = self.client.request(outgoing).await.map_err(|e| {
            tracing::debug!("Request {} {} failed before a response: {}", method, uri, e);
            DispatchError::Connection(format!("request to {} failed: {e}", uri.path()))
        })?;

        let (mut parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| {
                tracing::debug!(
                    "Response body from {} {} broke off after status {}: {}",
                    method,
                    uri,
                    parts.status,
                    e
                );
                DispatchError::Processing(format!(
                    "reading response body after status {} failed: {e}",
                    parts.status
                ))
            })?
            .to_bytes();

        // framing is decided again when the gateway writes the response
        parts.headers.remove(header::TRANSFER_ENCODING);
        Ok(Response::from_parts(parts, body))
    }

    async fn probe(&self, url: &str, probe_timeout: Duration) -> DispatchResult<bool> {
        let mut request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(Full::new(Bytes::new()))
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        Self::add_common_headers(&mut request)?;

        tracing::debug!("Health probing URL: {}", url);

        match timeout(probe_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let is_healthy = response.status().is_success();
                // drain so the connection can return to the pool
                let _ = response.into_body().collect().await;
                tracing::debug!("Health probe for {} result: {}", url, is_healthy);
                Ok(is_healthy)
            }
            Ok(Err(err)) => {
                tracing::debug!("Health probe error for {}: {}", url, err);
                Ok(false)
            }
            Err(_) => {
                tracing::debug!("Health probe timeout for {}", url);
                Ok(false)
            }
        }
    }
}
