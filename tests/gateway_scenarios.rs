// End-to-end scenarios: real downstream servers, the real outbound client and
// the axum listener.
mod common;

use axum::{Json, Router, http::HeaderMap, routing::get};
use common::{refused_addr, spawn_downstream, start_gateway};
use portico::{
    config::{AggregateConfig, ClusterConfig, RouteConfig, ServerConfig},
    core::aggregator::PARTIAL_FAILURE_HEADER,
    ports::event_sink::{EventLevel, GatewayEvent},
};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tower_http::catch_panic::CatchPanicLayer;

fn single_route(route: RouteConfig, address: String) -> ServerConfig {
    ServerConfig::builder()
        .route(route)
        .cluster("c", ClusterConfig::default().destination("one", address))
        .build()
        .unwrap()
}

async fn panics() -> &'static str {
    panic!("downstream handler failed")
}

async fn forwarded_for(headers: HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refused_connection_is_502() {
    let gateway = start_gateway(single_route(
        RouteConfig::new("/{everything}", "c"),
        format!("http://{}", refused_addr()),
    ))
    .await;

    let response = reqwest::get(gateway.url("/orders")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "connection_failure");
    // the destination address never leaks to the caller
    assert!(!body.to_string().contains("127.0.0.1"));
    assert!(gateway.events.names().contains(&"dispatch_failed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_downstream_500_passes_through_with_warning() {
    let downstream = spawn_downstream(
        Router::new()
            .route("/boom", get(panics))
            .layer(CatchPanicLayer::new()),
    )
    .await;
    let gateway = start_gateway(single_route(
        RouteConfig::new("/{everything}", "c"),
        format!("http://{downstream}"),
    ))
    .await;

    let response = reqwest::get(gateway.url("/boom")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let warning = gateway
        .events
        .events()
        .into_iter()
        .find(|event| matches!(event, GatewayEvent::DownstreamErrorStatus { .. }))
        .expect("downstream error event");
    assert_eq!(warning.level(), EventLevel::Warn);
    if let GatewayEvent::DownstreamErrorStatus { status, .. } = warning {
        assert_eq!(status.as_u16(), 500);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_ip_header_template() {
    let downstream =
        spawn_downstream(Router::new().route("/whoami", get(forwarded_for))).await;
    let gateway = start_gateway(single_route(
        RouteConfig::new("/me", "c")
            .downstream("/whoami")
            .request_header("X-Forwarded-For", "{RemoteIpAddress}"),
        format!("http://{downstream}"),
    ))
    .await;

    let response = reqwest::get(gateway.url("/me")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "127.0.0.1");
}

async fn aggregate_gateway(tolerate: bool) -> common::TestGateway {
    let users = spawn_downstream(
        Router::new().route("/users", get(|| async { Json(json!({"name": "ada"})) })),
    )
    .await;
    let notes = spawn_downstream(Router::new().route("/notes", get(|| async { "plain" }))).await;

    let config = ServerConfig::builder()
        .route(
            RouteConfig::new("/users", "users")
                .key("user")
                .downstream("/users"),
        )
        .route(
            RouteConfig::new("/notes", "notes")
                .key("notes")
                .downstream("/notes"),
        )
        .route(
            RouteConfig::new("/broken", "broken")
                .key("broken")
                .downstream("/broken"),
        )
        .aggregate(
            AggregateConfig::new("/dashboard", ["user", "notes", "broken"])
                .tolerate_partial_results(tolerate),
        )
        .cluster(
            "users",
            ClusterConfig::default().destination("one", format!("http://{users}")),
        )
        .cluster(
            "notes",
            ClusterConfig::default().destination("one", format!("http://{notes}")),
        )
        .cluster(
            "broken",
            ClusterConfig::default().destination("one", format!("http://{}", refused_addr())),
        )
        .build()
        .unwrap();
    start_gateway(config).await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_aggregate_partial_failure_is_502() {
    let gateway = aggregate_gateway(false).await;

    let response = reqwest::get(gateway.url("/dashboard")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "aggregate_partial_failure");
    assert_eq!(body["failed_keys"], json!(["broken"]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_aggregate_tolerated_partial_failure() {
    let gateway = aggregate_gateway(true).await;

    let response = reqwest::get(gateway.url("/dashboard")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[PARTIAL_FAILURE_HEADER.as_str()],
        "broken"
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"user": {"name": "ada"}, "notes": "plain", "broken": null})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unmatched_request_is_404() {
    let gateway = start_gateway(single_route(
        RouteConfig::new("/only", "c"),
        format!("http://{}", refused_addr()),
    ))
    .await;

    let response = reqwest::get(gateway.url("/elsewhere")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(gateway.events.names().contains(&"route_unmatched"));
}
