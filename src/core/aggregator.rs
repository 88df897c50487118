//! Fan-out/fan-in for composite routes.
//!
//! Each sub-route of an [`Aggregate`] is transformed, dispatched under its own
//! resilience policy and post-processed independently; all calls run
//! concurrently and every one is awaited, so one failure never cancels the
//! others. Bodies are merged into a JSON object keyed by route key.
use bytes::Bytes;
use futures_util::future::join_all;
use http::{HeaderName, HeaderValue, Response, StatusCode, header};
use serde_json::{Map, Value};

use crate::core::{
    dispatcher::{prepare_request, transform_response},
    error::GatewayError,
    gateway::GatewayResponse,
    pipeline::RequestContext,
    resilience::ResilientDispatcher,
    snapshot::{Aggregate, Route},
};

/// Lists the keys of failed sub-calls on a tolerated partial response.
pub const PARTIAL_FAILURE_HEADER: HeaderName = HeaderName::from_static("x-portico-partial-failure");

#[derive(Clone)]
pub struct Aggregator {
    resilient: ResilientDispatcher,
}

impl Aggregator {
    pub fn new(resilient: ResilientDispatcher) -> Self {
        Self { resilient }
    }

    /// Call every sub-route of `aggregate` and merge the results.
    pub async fn aggregate(
        &self,
        ctx: &RequestContext,
        aggregate: &Aggregate,
    ) -> Result<GatewayResponse, GatewayError> {
        let calls = aggregate
            .routes
            .iter()
            .map(|(key, route)| async move { (key.as_str(), self.call(ctx, route).await) });
        let results = join_all(calls).await;

        let mut merged = Map::with_capacity(results.len());
        let mut failed_keys = Vec::new();
        for (key, result) in results {
            match result {
                Ok(response) => {
                    merged.insert(key.to_string(), body_value(response.body()));
                }
                Err(error) => {
                    tracing::warn!(
                        "Aggregate {} sub-route '{}' failed for request {}: {}",
                        aggregate.id,
                        key,
                        ctx.request_id,
                        error
                    );
                    merged.insert(key.to_string(), Value::Null);
                    failed_keys.push(key.to_string());
                }
            }
        }

        if !failed_keys.is_empty() && !aggregate.tolerate_partial_results {
            return Err(GatewayError::AggregatePartialFailure { failed_keys });
        }

        let body = serde_json::to_vec(&Value::Object(merged)).map_err(|e| {
            GatewayError::DownstreamProcessingFailure {
                reason: format!("failed to encode aggregate body: {e}"),
            }
        })?;
        let mut response = Response::new(Bytes::from(body));
        *response.status_mut() = StatusCode::OK;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if !failed_keys.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&failed_keys.join(",")) {
                response.headers_mut().insert(PARTIAL_FAILURE_HEADER, value);
            }
        }
        Ok(response)
    }

    async fn call(&self, ctx: &RequestContext, route: &Route) -> Result<GatewayResponse, GatewayError> {
        let bindings = ctx.bindings().cloned().unwrap_or_default();
        let vars = ctx.template_vars(Some(&bindings));
        let prepared = prepare_request(
            &ctx.request,
            route,
            &bindings,
            &vars,
            ctx.snapshot.global(),
        )?;

        let cluster = ctx.snapshot.cluster(&route.cluster_id).ok_or_else(|| {
            GatewayError::NoHealthyDestination {
                cluster_id: route.cluster_id.clone(),
            }
        })?;

        let outcome = self
            .resilient
            .execute(
                &ctx.request_id,
                cluster,
                &route.resilience,
                &prepared,
                &ctx.request.headers,
            )
            .await?;

        let mut response = outcome.response;
        let mut vars = vars;
        vars.downstream_base_url = Some(outcome.destination.address().as_str());
        transform_response(&mut response, route, &vars)?;
        Ok(response)
    }
}

/// A sub-response body as JSON, or as a string when it is not JSON.
fn body_value(body: &Bytes) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}
