//! Outbound request construction and the downstream call itself.
//!
//! Destination-independent work (path rewrite, header copy and transforms,
//! query additions) happens once in [`prepare_request`]; each attempt then
//! only joins the prepared request onto the selected destination, so retries
//! landing on another destination resend identical bytes.
use std::sync::Arc;

use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, Method, Request, Response, Uri,
    header::{self, HeaderValue},
};

use crate::{
    core::{
        backend::Destination,
        error::GatewayError,
        gateway::GatewayRequest,
        route_matcher::PathBindings,
        snapshot::{GlobalSettings, Route},
        template::{TemplateVars, apply_header_transforms, render},
    },
    ports::http_client::{DispatchError, DispatchResult, DownstreamClient},
};

/// Headers that describe a single transport hop and are never forwarded.
pub const HOP_BY_HOP_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

/// Request ready to be sent to any destination of the route's cluster.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl PreparedRequest {
    /// Address the prepared request to one destination.
    pub fn to_request(&self, destination: &Destination) -> DispatchResult<Request<Bytes>> {
        let uri: Uri = destination
            .address()
            .join(&self.path_and_query)
            .parse()
            .map_err(|e| DispatchError::InvalidRequest(format!("invalid downstream URI: {e}")))?;

        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .body(self.body.clone())
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

/// Remove hop-by-hop headers, including any named by the `Connection` header.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP_HEADERS.iter().chain(listed.iter()) {
        headers.remove(name);
    }
}

fn downstream_path(request: &GatewayRequest, route: &Route, bindings: &PathBindings) -> String {
    match &route.downstream_path {
        Some(template) => template.render(bindings),
        None => request.path().to_string(),
    }
}

/// Apply the route's request-side rewrites to an inbound request.
pub fn prepare_request(
    request: &GatewayRequest,
    route: &Route,
    bindings: &PathBindings,
    vars: &TemplateVars<'_>,
    global: &GlobalSettings,
) -> Result<PreparedRequest, GatewayError> {
    let mut headers = request.headers.clone();
    strip_hop_by_hop(&mut headers);
    for excluded in &global.excluded_headers {
        headers.remove(excluded);
    }

    apply_header_transforms(
        &mut headers,
        route
            .request_headers
            .iter()
            .map(|(name, template)| (name, template.as_str())),
        vars,
    )
    .map_err(|reason| GatewayError::DownstreamProcessingFailure { reason })?;

    let mut query: Vec<String> = request
        .query()
        .filter(|query| !query.is_empty())
        .map(|query| vec![query.to_string()])
        .unwrap_or_default();
    for (name, template) in &route.add_queries {
        query.push(format!(
            "{}={}",
            urlencoding::encode(name),
            urlencoding::encode(&render(template, vars))
        ));
    }

    let mut path_and_query = downstream_path(request, route, bindings);
    if !query.is_empty() {
        path_and_query.push('?');
        path_and_query.push_str(&query.join("&"));
    }

    if request.body.is_empty() {
        headers.remove(header::CONTENT_LENGTH);
    } else if let Ok(length) = HeaderValue::from_str(&request.body.len().to_string()) {
        headers.insert(header::CONTENT_LENGTH, length);
    }

    Ok(PreparedRequest {
        method: route
            .downstream_method
            .clone()
            .unwrap_or_else(|| request.method.clone()),
        path_and_query,
        headers,
        body: request.body.clone(),
    })
}

/// Apply the route's response-side rewrites to a downstream response.
pub fn transform_response(
    response: &mut Response<Bytes>,
    route: &Route,
    vars: &TemplateVars<'_>,
) -> Result<(), GatewayError> {
    strip_hop_by_hop(response.headers_mut());
    apply_header_transforms(
        response.headers_mut(),
        route
            .response_headers
            .iter()
            .map(|(name, template)| (name, template.as_str())),
        vars,
    )
    .map_err(|reason| GatewayError::DownstreamProcessingFailure { reason })
}

/// Sends prepared requests through the downstream client port.
#[derive(Clone)]
pub struct Dispatcher {
    client: Arc<dyn DownstreamClient>,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn DownstreamClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn DownstreamClient> {
        &self.client
    }

    pub async fn dispatch(
        &self,
        destination: &Destination,
        prepared: &PreparedRequest,
    ) -> DispatchResult<Response<Bytes>> {
        let request = prepared.to_request(destination)?;
        tracing::debug!(
            "Dispatching {} {} to destination {}",
            request.method(),
            prepared.path_and_query,
            destination.id()
        );
        self.client.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use super::*;
    use crate::core::{
        backend::{DestinationRuntime, DestinationUrl},
        route_matcher::PathTemplate,
        snapshot::tests::test_route,
    };

    fn inbound(uri: &str) -> GatewayRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("x-private"));
        headers.insert("x-private", HeaderValue::from_static("secret"));
        headers.insert("x-keep", HeaderValue::from_static("yes"));
        headers.insert("x-drop", HeaderValue::from_static("no"));
        GatewayRequest {
            method: Method::GET,
            uri: uri.parse().unwrap(),
            headers,
            body: Bytes::new(),
            remote_addr: Some(SocketAddr::from(([127, 0, 0, 1], 50000))),
        }
    }

    #[test]
    fn test_prepare_request_rewrites_path_headers_and_query() {
        let mut route = test_route("r", "/users/{id}");
        route.downstream_path = Some(PathTemplate::parse("/api/users/{id}").unwrap());
        route.request_headers = vec![(
            HeaderName::from_static("x-forwarded-for"),
            "{RemoteIpAddress}".to_string(),
        )];
        route.add_queries = vec![("user".to_string(), "{id}".to_string())];

        let request = inbound("/users/42?expand=true");
        let bindings = route.upstream.matches(request.path(), false).unwrap();
        let vars = TemplateVars {
            bindings: Some(&bindings),
            remote_ip: Some("127.0.0.1".to_string()),
            ..TemplateVars::default()
        };
        let global = GlobalSettings {
            excluded_headers: vec![HeaderName::from_static("x-drop")],
            ..GlobalSettings::default()
        };

        let prepared = prepare_request(&request, &route, &bindings, &vars, &global).unwrap();

        assert_eq!(prepared.path_and_query, "/api/users/42?expand=true&user=42");
        assert_eq!(prepared.headers["x-forwarded-for"], "127.0.0.1");
        assert_eq!(prepared.headers["x-keep"], "yes");
        assert!(prepared.headers.get(header::HOST).is_none());
        assert!(prepared.headers.get(header::CONNECTION).is_none());
        assert!(prepared.headers.get("x-private").is_none());
        assert!(prepared.headers.get("x-drop").is_none());
    }

    #[test]
    fn test_prepare_request_without_downstream_template_keeps_path() {
        let route = test_route("r", "/{everything}");
        let request = inbound("/a/b/c");
        let bindings = route.upstream.matches(request.path(), false).unwrap();

        let prepared = prepare_request(
            &request,
            &route,
            &bindings,
            &TemplateVars::default(),
            &GlobalSettings::default(),
        )
        .unwrap();
        assert_eq!(prepared.path_and_query, "/a/b/c");
        assert_eq!(prepared.method, Method::GET);
    }

    #[test]
    fn test_to_request_targets_destination() {
        let destination = Destination::new(
            1,
            Arc::new(DestinationRuntime::new(
                "c",
                "d",
                DestinationUrl::new("http://127.0.0.1:9000").unwrap(),
            )),
        );
        let prepared = PreparedRequest {
            method: Method::POST,
            path_and_query: "/x?y=1".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"payload"),
        };

        let request = prepared.to_request(&destination).unwrap();
        assert_eq!(request.uri().to_string(), "http://127.0.0.1:9000/x?y=1");
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.body().as_ref(), b"payload");
    }
}
