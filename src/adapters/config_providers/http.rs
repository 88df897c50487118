use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    time::Duration,
};

use async_trait::async_trait;
use config::FileFormat;
use eyre::{Context, Result};
use reqwest::Client;
use tokio::sync::mpsc;

use crate::{
    config::{loader::parse_config_str, models::ServerConfig},
    ports::config_provider::ConfigProvider,
};

/// Configuration provider that fetches a JSON document from an HTTP URL and
/// polls it for changes.
pub struct HttpConfigProvider {
    url: String,
    client: Client,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl HttpConfigProvider {
    /// Must be called inside a Tokio runtime: spawns the polling task.
    pub fn new(url: String, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let provider = Self {
            url: url.clone(),
            client: client.clone(),
            update_rx: std::sync::Mutex::new(Some(rx)),
        };

        tokio::spawn(async move {
            let mut last_body_hash: Option<u64> = None;
            let mut interval = tokio::time::interval(poll_interval);

            loop {
                interval.tick().await;

                // the raw body is hashed; map ordering makes re-serialized configs unstable
                match Self::fetch_body(&client, &url).await {
                    Ok(body) => {
                        let mut hasher = DefaultHasher::new();
                        body.hash(&mut hasher);
                        let new_hash = hasher.finish();

                        match last_body_hash {
                            Some(last) if last != new_hash => {
                                tracing::info!("Remote configuration changed at {}", url);
                                let _ = tx.try_send(());
                            }
                            _ => {}
                        }
                        last_body_hash = Some(new_hash);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to poll remote config: {:#}", e);
                    }
                }

                if tx.is_closed() {
                    tracing::debug!("Config watcher dropped, stopping poll of {}", url);
                    break;
                }
            }
        });

        provider
    }

    async fn fetch_body(client: &Client, url: &str) -> Result<String> {
        client
            .get(url)
            .send()
            .await
            .wrap_err("Failed to send request")?
            .error_for_status()
            .wrap_err("Remote config endpoint returned an error status")?
            .text()
            .await
            .wrap_err("Failed to read config body")
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn load_config(&self) -> Result<ServerConfig> {
        let body = Self::fetch_body(&self.client, &self.url).await?;
        parse_config_str(&body, FileFormat::Json)
            .wrap_err_with(|| format!("Failed to parse JSON config from {}", self.url))
    }

    fn watch(&self) -> Result<mpsc::Receiver<()>> {
        self.update_rx
            .lock()
            .map_err(|_| eyre::eyre!("config watch receiver lock poisoned"))?
            .take()
            .ok_or_else(|| eyre::eyre!("watch() can only be called once"))
    }

    fn source(&self) -> String {
        self.url.clone()
    }
}
