use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_config, models::ServerConfig},
    ports::config_provider::ConfigProvider,
};

/// Configuration provider that loads from a local file and watches for changes.
pub struct FileConfigProvider {
    path: PathBuf,
    // kept alive for as long as the provider lives
    _watcher: Option<notify::RecommendedWatcher>,
    update_tx: mpsc::Sender<()>,
    // taken once by `watch()`
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);

        let mut provider = Self {
            path,
            _watcher: None,
            update_tx: tx,
            update_rx: std::sync::Mutex::new(Some(rx)),
        };

        provider.init_watcher()?;
        Ok(provider)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_watcher(&mut self) -> Result<()> {
        let tx = self.update_tx.clone();
        let config_filename = self
            .path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid config path: {}", self.path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&config_filename))
                        {
                            tracing::debug!("Config file changed: {:?}", event.kind);
                            // a pending signal already covers this change
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })?;

        let watch_dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch config directory")?;

        self._watcher = Some(watcher);
        Ok(())
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<ServerConfig> {
        let path_str = self
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", self.path.display()))?;
        load_config(path_str).await
    }

    fn watch(&self) -> Result<mpsc::Receiver<()>> {
        self.update_rx
            .lock()
            .map_err(|_| eyre::eyre!("config watch receiver lock poisoned"))?
            .take()
            .ok_or_else(|| eyre::eyre!("watch() can only be called once"))
    }

    fn source(&self) -> String {
        self.path.display().to_string()
    }
}
