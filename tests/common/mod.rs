#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc};

use axum::Router;
use parking_lot::Mutex;
use portico::{
    ConfigStore, GatewayService, HttpClientAdapter, HttpHandler,
    adapters::router,
    config::ServerConfig,
    ports::event_sink::{EventSink, GatewayEvent},
};
use tokio::net::TcpListener;

/// Keeps every event for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GatewayEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(GatewayEvent::name).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &GatewayEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Serve `app` on an ephemeral loopback port.
pub async fn spawn_downstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A loopback address nothing listens on.
pub fn refused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub store: Arc<ConfigStore>,
    pub events: Arc<RecordingSink>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Run a full gateway (real outbound client, real listener) over `config`.
pub async fn start_gateway(config: ServerConfig) -> TestGateway {
    let events = Arc::new(RecordingSink::default());
    let store = Arc::new(
        ConfigStore::from_config(&config, events.clone())
            .await
            .unwrap(),
    );
    let client = Arc::new(HttpClientAdapter::new().unwrap());
    let gateway = GatewayService::with_events(Arc::clone(&store), client, events.clone());
    let app = router(Arc::new(HttpHandler::new(gateway)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestGateway {
        addr,
        store,
        events,
    }
}
