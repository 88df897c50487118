//! Core gateway orchestration service.
//!
//! `GatewayService` is the single entry point the hosting boundary calls:
//! `handle(GatewayRequest) -> GatewayResponse`. It pins the current
//! configuration snapshot for the lifetime of the request and hands the
//! request to the [`PipelineExecutor`]. The service holds no per-request
//! state and is cheap to clone.
use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use http::{HeaderMap, Method, Response, Uri, header};

use crate::{
    core::{
        dispatcher::Dispatcher, pipeline::PipelineExecutor, resilience::ResilientDispatcher,
        store::ConfigStore,
    },
    metrics::set_active_requests,
    ports::{
        auth::Authenticator,
        cache::ResponseCache,
        event_sink::{EventSink, NoopEventSink},
        http_client::DownstreamClient,
    },
};

/// Fully buffered inbound request as seen by the routing core.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Peer address of the caller, when the listener knows it.
    pub remote_addr: Option<SocketAddr>,
}

/// Outbound response produced by the routing core.
pub type GatewayResponse = Response<Bytes>;

impl GatewayRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Host the caller addressed: the `Host` header, else the URI authority.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.uri.authority().map(|authority| authority.as_str()))
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_addr.map(|addr| addr.ip())
    }

    /// Path plus query exactly as received.
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri.path())
    }
}

/// Central orchestrator: snapshot lookup plus pipeline execution.
#[derive(Clone)]
pub struct GatewayService {
    store: Arc<ConfigStore>,
    executor: Arc<PipelineExecutor>,
    in_flight: Arc<AtomicU64>,
}

impl GatewayService {
    /// Create a service over `store`, sending downstream calls through `client`.
    ///
    /// Routes that require authentication are denied until an authenticator
    /// is attached with [`with_authenticator`](Self::with_authenticator);
    /// cache policies are inert until a cache is attached.
    pub fn new(store: Arc<ConfigStore>, client: Arc<dyn DownstreamClient>) -> Self {
        Self::with_events(store, client, Arc::new(NoopEventSink))
    }

    pub fn with_events(
        store: Arc<ConfigStore>,
        client: Arc<dyn DownstreamClient>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let resilient = ResilientDispatcher::new(Dispatcher::new(client), Arc::clone(&events));
        Self {
            store,
            executor: Arc::new(PipelineExecutor::new(resilient, events)),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.executor = Arc::new(self.executor.as_ref().clone().authenticator(authenticator));
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.executor = Arc::new(self.executor.as_ref().clone().cache(cache));
        self
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Route, dispatch and post-process one request.
    ///
    /// Never fails: every error is rendered as a synthesized response.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let active = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        set_active_requests(active);

        let snapshot = self.store.current();
        let response = self.executor.execute(snapshot, request).await;

        let active = self.in_flight.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        set_active_requests(active);
        response
    }
}
