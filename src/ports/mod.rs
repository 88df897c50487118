pub mod auth;
pub mod cache;
pub mod config_provider;
pub mod event_sink;
pub mod http_client;
