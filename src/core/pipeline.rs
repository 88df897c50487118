//! Ordered request pipeline.
//!
//! Every request walks the stages of [`Stage::ORDER`] over one
//! [`RequestContext`]. A stage either continues, answers the request itself
//! ([`StageOutcome::Respond`]), or fails with a [`GatewayError`]; the latter
//! two end the walk. Whatever ends it, the executor finishes the response the
//! same way: request-id echo, `RequestCompleted` event, request metrics.
use std::{fmt, net::IpAddr, sync::Arc, time::Instant};

use http::{HeaderValue, Method};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    core::{
        aggregator::Aggregator,
        backend::Destination,
        dispatcher::{PreparedRequest, prepare_request, transform_response},
        error::GatewayError,
        gateway::{GatewayRequest, GatewayResponse},
        resilience::ResilientDispatcher,
        route_matcher::{MatchTarget, PathBindings, RouteMatch},
        snapshot::{ConfigSnapshot, Route},
        template::TemplateVars,
    },
    metrics::{increment_request_total, increment_route_unmatched, record_request_duration},
    ports::{
        auth::{Authenticator, Identity},
        cache::{CachedResponse, ResponseCache},
        event_sink::{EventSink, GatewayEvent},
    },
    tracing_setup::create_request_span,
};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ResolveRoute,
    Authenticate,
    RateLimit,
    TransformRequest,
    CacheLookup,
    Dispatch,
    TransformResponse,
    CacheStore,
}

impl Stage {
    pub const ORDER: [Stage; 8] = [
        Stage::ResolveRoute,
        Stage::Authenticate,
        Stage::RateLimit,
        Stage::TransformRequest,
        Stage::CacheLookup,
        Stage::Dispatch,
        Stage::TransformResponse,
        Stage::CacheStore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ResolveRoute => "resolve_route",
            Stage::Authenticate => "authenticate",
            Stage::RateLimit => "rate_limit",
            Stage::TransformRequest => "transform_request",
            Stage::CacheLookup => "cache_lookup",
            Stage::Dispatch => "dispatch",
            Stage::TransformResponse => "transform_response",
            Stage::CacheStore => "cache_store",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a stage that did not fail.
#[derive(Debug)]
pub enum StageOutcome {
    Continue,
    /// Terminal: skip the remaining stages and answer with this response.
    Respond(GatewayResponse),
}

/// Per-request state threaded through the stages. Never shared.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub request: GatewayRequest,
    pub snapshot: Arc<ConfigSnapshot>,
    pub started: Instant,
    pub matched: Option<RouteMatch>,
    pub identity: Option<Identity>,
    pub prepared: Option<PreparedRequest>,
    pub cache_key: Option<String>,
    pub response: Option<GatewayResponse>,
    pub destination: Option<Destination>,
}

impl RequestContext {
    /// Context for `request`, reusing its request id header when present.
    pub fn new(snapshot: Arc<ConfigSnapshot>, mut request: GatewayRequest) -> Self {
        let request_id_header = snapshot.global().request_id_header.clone();
        let inbound = request_id_header
            .as_ref()
            .and_then(|name| request.headers.get(name))
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let request_id = match inbound {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                if let (Some(name), Ok(value)) = (request_id_header, HeaderValue::from_str(&id)) {
                    request.headers.insert(name, value);
                }
                id
            }
        };

        Self {
            request_id,
            request,
            snapshot,
            started: Instant::now(),
            matched: None,
            identity: None,
            prepared: None,
            cache_key: None,
            response: None,
            destination: None,
        }
    }

    /// Matched simple route, if the request resolved to one.
    pub fn route(&self) -> Option<&Arc<Route>> {
        match self.matched.as_ref().map(|m| &m.target) {
            Some(MatchTarget::Route(route)) => Some(route),
            _ => None,
        }
    }

    pub fn bindings(&self) -> Option<&PathBindings> {
        self.matched.as_ref().map(|m| &m.bindings)
    }

    /// Routes whose policies govern this request: the route itself, or
    /// every sub-route of an aggregate.
    pub fn governing_routes(&self) -> Vec<Arc<Route>> {
        match self.matched.as_ref().map(|m| &m.target) {
            Some(MatchTarget::Route(route)) => vec![Arc::clone(route)],
            Some(MatchTarget::Aggregate(aggregate)) => aggregate
                .routes
                .iter()
                .map(|(_, route)| Arc::clone(route))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Template variables for this request.
    pub fn template_vars<'a>(&'a self, bindings: Option<&'a PathBindings>) -> TemplateVars<'a> {
        TemplateVars {
            bindings,
            remote_ip: self.request.remote_ip().map(|ip| ip.to_string()),
            upstream_host: self.request.host(),
            base_url: self.snapshot.global().base_url.as_deref(),
            request_id: Some(&self.request_id),
            downstream_base_url: self.destination.as_ref().map(|d| d.address().as_str()),
        }
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.request.remote_ip()
    }

    fn target_id(&self) -> Option<String> {
        self.matched.as_ref().map(|m| m.target.id().to_string())
    }
}

/// Runs [`Stage::ORDER`] for each request.
#[derive(Clone)]
pub struct PipelineExecutor {
    resilient: ResilientDispatcher,
    aggregator: Aggregator,
    authenticator: Option<Arc<dyn Authenticator>>,
    cache: Option<Arc<dyn ResponseCache>>,
    events: Arc<dyn EventSink>,
}

impl PipelineExecutor {
    pub fn new(resilient: ResilientDispatcher, events: Arc<dyn EventSink>) -> Self {
        Self {
            aggregator: Aggregator::new(resilient.clone()),
            resilient,
            authenticator: None,
            cache: None,
            events,
        }
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run the pipeline for `request` against `snapshot` and produce the
    /// final response, synthesizing one from the error if a stage failed.
    pub async fn execute(
        &self,
        snapshot: Arc<ConfigSnapshot>,
        request: GatewayRequest,
    ) -> GatewayResponse {
        let mut ctx = RequestContext::new(snapshot, request);
        let span = create_request_span(
            ctx.request.method.as_str(),
            ctx.request.path(),
            &ctx.request_id,
        );

        let result = self.run(&mut ctx).instrument(span.clone()).await;
        let mut response = match result {
            Ok(response) => response,
            Err(error) => {
                if matches!(error, GatewayError::DownstreamProcessingFailure { .. }) {
                    tracing::warn!(parent: &span, "Request {} failed: {}", ctx.request_id, error);
                } else {
                    tracing::debug!(parent: &span, "Request {} failed: {}", ctx.request_id, error);
                }
                error.to_response()
            }
        };

        if let Some(name) = &ctx.snapshot.global().request_id_header {
            if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
                response.headers_mut().insert(name.clone(), value);
            }
        }

        let elapsed = ctx.started.elapsed();
        let route_id = ctx.target_id();
        let status = response.status();
        span.record("http.status_code", status.as_u16());
        span.record("duration_ms", elapsed.as_millis() as u64);
        if let Some(route_id) = &route_id {
            span.record("route.id", route_id.as_str());
        }

        let route_label = route_id.as_deref().unwrap_or("unmatched");
        increment_request_total(route_label, ctx.request.method.as_str(), status.as_u16());
        record_request_duration(route_label, ctx.request.method.as_str(), elapsed);
        self.events.emit(&GatewayEvent::RequestCompleted {
            request_id: ctx.request_id.clone(),
            route_id,
            method: ctx.request.method.clone(),
            status,
            elapsed,
        });

        response
    }

    /// Walk the stages until one responds or fails.
    pub async fn run(&self, ctx: &mut RequestContext) -> Result<GatewayResponse, GatewayError> {
        for stage in Stage::ORDER {
            match self.run_stage(stage, ctx).await? {
                StageOutcome::Continue => {}
                StageOutcome::Respond(response) => {
                    tracing::debug!("Stage {} answered request {}", stage, ctx.request_id);
                    return Ok(response);
                }
            }
        }

        ctx.response
            .take()
            .ok_or_else(|| GatewayError::DownstreamProcessingFailure {
                reason: "pipeline finished without a response".to_string(),
            })
    }

    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &mut RequestContext,
    ) -> Result<StageOutcome, GatewayError> {
        match stage {
            Stage::ResolveRoute => self.resolve_route(ctx),
            Stage::Authenticate => self.authenticate(ctx).await,
            Stage::RateLimit => Self::rate_limit(ctx),
            Stage::TransformRequest => Self::rewrite_request(ctx),
            Stage::CacheLookup => self.cache_lookup(ctx).await,
            Stage::Dispatch => self.dispatch(ctx).await,
            Stage::TransformResponse => Self::rewrite_response(ctx),
            Stage::CacheStore => self.cache_store(ctx).await,
        }
    }

    fn resolve_route(&self, ctx: &mut RequestContext) -> Result<StageOutcome, GatewayError> {
        let request = &ctx.request;
        match ctx
            .snapshot
            .match_request(&request.method, request.host(), request.path())
        {
            Some(matched) => {
                self.events.emit(&GatewayEvent::RouteMatched {
                    request_id: ctx.request_id.clone(),
                    route_id: matched.target.id().to_string(),
                    method: request.method.clone(),
                    path: request.path().to_string(),
                });
                ctx.matched = Some(matched);
                Ok(StageOutcome::Continue)
            }
            None => {
                increment_route_unmatched();
                self.events.emit(&GatewayEvent::RouteUnmatched {
                    request_id: ctx.request_id.clone(),
                    method: request.method.clone(),
                    path: request.path().to_string(),
                });
                Err(GatewayError::RouteNotFound {
                    method: request.method.to_string(),
                    path: request.path().to_string(),
                })
            }
        }
    }

    async fn authenticate(&self, ctx: &mut RequestContext) -> Result<StageOutcome, GatewayError> {
        let required: Vec<Arc<Route>> = ctx
            .governing_routes()
            .into_iter()
            .filter(|route| route.authentication.is_some())
            .collect();
        if required.is_empty() {
            return Ok(StageOutcome::Continue);
        }

        let Some(authenticator) = &self.authenticator else {
            return Err(GatewayError::AuthenticationDenied {
                reason: "no authenticator configured".to_string(),
            });
        };
        let identity = authenticator.authenticate(&ctx.request.headers).await?;

        for route in &required {
            let allowed = route
                .authentication
                .as_ref()
                .map(|auth| auth.allowed_scopes.as_slice())
                .unwrap_or_default();
            if !identity.has_any_scope(allowed) {
                return Err(GatewayError::AuthorizationDenied {
                    subject: identity.subject.clone(),
                });
            }
        }

        ctx.identity = Some(identity);
        Ok(StageOutcome::Continue)
    }

    fn rate_limit(ctx: &mut RequestContext) -> Result<StageOutcome, GatewayError> {
        let client_ip = ctx.client_ip();
        for route in ctx.governing_routes() {
            if let Some(limiter) = &route.rate_limiter {
                limiter.check(&ctx.request.headers, client_ip)?;
            }
        }
        Ok(StageOutcome::Continue)
    }

    fn rewrite_request(ctx: &mut RequestContext) -> Result<StageOutcome, GatewayError> {
        // aggregates transform per sub-route while dispatching
        let Some(route) = ctx.route() else {
            return Ok(StageOutcome::Continue);
        };
        let bindings = ctx.bindings();
        let vars = ctx.template_vars(bindings);
        let prepared = prepare_request(
            &ctx.request,
            route,
            bindings.unwrap_or(&PathBindings::default()),
            &vars,
            ctx.snapshot.global(),
        )?;
        ctx.prepared = Some(prepared);
        Ok(StageOutcome::Continue)
    }

    fn cacheable(ctx: &RequestContext) -> bool {
        ctx.request.method == Method::GET && ctx.route().is_some_and(|r| r.cache.is_some())
    }

    async fn cache_lookup(&self, ctx: &mut RequestContext) -> Result<StageOutcome, GatewayError> {
        let Some(cache) = &self.cache else {
            return Ok(StageOutcome::Continue);
        };
        if !Self::cacheable(ctx) {
            return Ok(StageOutcome::Continue);
        }
        let Some(route) = ctx.route() else {
            return Ok(StageOutcome::Continue);
        };

        let key = cache_key(&route.id, &ctx.request);
        if let Some(hit) = cache.get(&key).await {
            tracing::debug!("Cache hit for {} on route {}", key, route.id);
            return Ok(StageOutcome::Respond(hit.into_response()));
        }
        ctx.cache_key = Some(key);
        Ok(StageOutcome::Continue)
    }

    async fn dispatch(&self, ctx: &mut RequestContext) -> Result<StageOutcome, GatewayError> {
        let target = match ctx.matched.as_ref() {
            Some(matched) => matched.target.clone(),
            None => {
                return Err(GatewayError::RouteNotFound {
                    method: ctx.request.method.to_string(),
                    path: ctx.request.path().to_string(),
                });
            }
        };

        match target {
            MatchTarget::Aggregate(aggregate) => {
                let response = self.aggregator.aggregate(ctx, &aggregate).await?;
                Ok(StageOutcome::Respond(response))
            }
            MatchTarget::Route(route) => {
                let cluster = ctx.snapshot.cluster(&route.cluster_id).cloned().ok_or_else(|| {
                    GatewayError::NoHealthyDestination {
                        cluster_id: route.cluster_id.clone(),
                    }
                })?;
                let prepared = ctx.prepared.as_ref().ok_or_else(|| {
                    GatewayError::DownstreamProcessingFailure {
                        reason: "request was not prepared".to_string(),
                    }
                })?;

                let outcome = self
                    .resilient
                    .execute(
                        &ctx.request_id,
                        &cluster,
                        &route.resilience,
                        prepared,
                        &ctx.request.headers,
                    )
                    .await?;
                if outcome.attempts > 1 {
                    tracing::debug!(
                        "Request {} succeeded after {} attempts",
                        ctx.request_id,
                        outcome.attempts
                    );
                }
                ctx.response = Some(outcome.response);
                ctx.destination = Some(outcome.destination);
                Ok(StageOutcome::Continue)
            }
        }
    }

    fn rewrite_response(ctx: &mut RequestContext) -> Result<StageOutcome, GatewayError> {
        let Some(mut response) = ctx.response.take() else {
            return Ok(StageOutcome::Continue);
        };
        if let Some(route) = ctx.route() {
            let vars = ctx.template_vars(ctx.bindings());
            transform_response(&mut response, route, &vars)?;
        }
        ctx.response = Some(response);
        Ok(StageOutcome::Continue)
    }

    async fn cache_store(&self, ctx: &mut RequestContext) -> Result<StageOutcome, GatewayError> {
        let (Some(cache), Some(key)) = (&self.cache, ctx.cache_key.take()) else {
            return Ok(StageOutcome::Continue);
        };
        let (Some(policy), Some(response)) =
            (ctx.route().and_then(|r| r.cache.as_ref()), ctx.response.as_ref())
        else {
            return Ok(StageOutcome::Continue);
        };

        if response.status().is_success() {
            cache
                .put(
                    key,
                    policy.region.clone(),
                    CachedResponse::from_response(response),
                    policy.ttl,
                )
                .await;
        }
        Ok(StageOutcome::Continue)
    }
}

/// Cache key for a GET on `route_id`: route plus the path and query as received.
pub fn cache_key(route_id: &str, request: &GatewayRequest) -> String {
    format!("{route_id}:{}", request.path_and_query())
}
