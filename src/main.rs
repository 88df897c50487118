use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use portico::{
    adapters::{
        CompositeEventSink, FileConfigProvider, HealthChecker, HttpClientAdapter,
        HttpConfigProvider, HttpHandler, MemoryResponseCache, MetricsEventSink,
        StaticTokenAuthenticator, TracingEventSink, router,
    },
    config::{ServerConfigValidator, loader::load_config},
    core::{ConfigStore, GatewayService, snapshot::SnapshotBuilder},
    metrics,
    ports::{config_provider::ConfigProvider, event_sink::EventSink},
    tracing_setup,
    utils::graceful_shutdown::GracefulShutdown,
};
use tokio::{sync::mpsc, task::JoinHandle};

/// Quiet period after a change notification before the config is re-read.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);
/// Period of the expired cache entry and sticky session sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Human readable logs instead of JSON
    #[clap(long, global = true)]
    pretty_logs: bool,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file or http(s) URL to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn create_config_provider(config_path: &str) -> Result<Arc<dyn ConfigProvider>> {
    if config_path.starts_with("http://") || config_path.starts_with("https://") {
        Ok(Arc::new(HttpConfigProvider::new(
            config_path.to_string(),
            Duration::from_secs(10),
        )))
    } else {
        Ok(Arc::new(FileConfigProvider::new(config_path)?))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config, args.pretty_logs).await,
        None => serve(&args.config, args.pretty_logs).await,
    }
}

async fn serve(config_path: &str, pretty_logs: bool) -> Result<()> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("A rustls crypto provider was already installed");
    }

    if pretty_logs {
        tracing_setup::init_console_tracing()?;
    } else {
        tracing_setup::init_tracing()?;
    }
    metrics::init_metrics()?;

    tracing::info!("Loading initial configuration from {config_path}");

    let config_provider =
        create_config_provider(config_path).context("Failed to create config provider")?;
    let config = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;

    let events: Arc<dyn EventSink> = Arc::new(
        CompositeEventSink::new()
            .with(Arc::new(TracingEventSink))
            .with(Arc::new(MetricsEventSink)),
    );

    let store = Arc::new(
        ConfigStore::from_config(&config, Arc::clone(&events))
            .await
            .context("Initial configuration rejected")?,
    );
    let client = Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client")?);
    let cache = Arc::new(MemoryResponseCache::new());

    // tokens are read once at startup
    let gateway = GatewayService::with_events(Arc::clone(&store), client.clone(), events)
        .with_authenticator(Arc::new(StaticTokenAuthenticator::from_config(
            &config.authentication,
        )))
        .with_cache(cache.clone());

    let mut background: Vec<JoinHandle<()>> = Vec::new();

    let health_checker = HealthChecker::new(Arc::clone(&store), client);
    background.push(tokio::spawn(async move {
        health_checker.run().await;
    }));

    {
        let store = Arc::clone(&store);
        background.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let remaining = cache.purge_expired().await;
                tracing::trace!("Response cache sweep left {} entries", remaining);

                for cluster in store.current().clusters().values() {
                    let sessions = cluster.balancer.purge_expired_sessions().await;
                    if sessions > 0 {
                        tracing::trace!(
                            "Cluster {} keeps {} sticky sessions",
                            cluster.id,
                            sessions
                        );
                    }
                }
            }
        }));
    }

    match config_provider.watch() {
        Ok(updates) => {
            background.push(tokio::spawn(reload_loop(
                Arc::clone(&config_provider),
                Arc::clone(&store),
                updates,
                config.listen_addr.clone(),
            )));
        }
        Err(e) => tracing::warn!("Configuration hot reload disabled: {:#}", e),
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Failed to parse listen address {}", config.listen_addr))?;

    for route in store.current().routes() {
        tracing::info!(
            "Configured route {} -> cluster {}",
            route.id,
            route.cluster_id
        );
    }

    let app = router(Arc::new(HttpHandler::new(gateway)));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    tracing::info!("Portico API Gateway listening on {}", addr);
    println!("Portico API Gateway listening on {addr}");

    let shutdown = Arc::new(GracefulShutdown::new());
    {
        let shutdown = Arc::clone(&shutdown);
        background.push(tokio::spawn(async move {
            shutdown.run_signal_handler().await;
        }));
    }

    let token = shutdown.token();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        token.wait().await;
    });

    let drain_deadline = {
        let token = shutdown.token();
        let drain_timeout = shutdown.drain_timeout();
        async move {
            token.wait().await;
            tokio::time::sleep(drain_timeout).await;
        }
    };

    tokio::select! {
        result = server => result.context("Server error")?,
        _ = drain_deadline => {
            tracing::warn!(
                "In-flight requests did not finish within {:?}, forcing shutdown",
                shutdown.drain_timeout()
            );
        }
    }

    for handle in background {
        handle.abort();
    }

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Re-read and publish the configuration whenever the provider reports a
/// change. Bursts of notifications collapse into one reload.
async fn reload_loop(
    provider: Arc<dyn ConfigProvider>,
    store: Arc<ConfigStore>,
    mut updates: mpsc::Receiver<()>,
    listen_addr: String,
) {
    while updates.recv().await.is_some() {
        tokio::time::sleep(RELOAD_DEBOUNCE).await;
        while updates.try_recv().is_ok() {}

        tracing::info!("Configuration change detected in {}", provider.source());

        let config = match provider.load_config().await {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to load updated configuration: {:#}", e);
                continue;
            }
        };

        if config.listen_addr != listen_addr {
            tracing::warn!(
                "listen_addr changed to {}; the new address applies after a restart",
                config.listen_addr
            );
        }

        match store.publish(&config).await {
            Ok(snapshot) => tracing::info!(
                "Configuration generation {} is now active",
                snapshot.generation()
            ),
            Err(e) => tracing::error!("Updated configuration rejected, keeping previous: {}", e),
        }
    }

    tracing::debug!("Configuration watcher closed");
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        bail!("Configuration file '{config_path}' not found");
    }

    let config = load_config(config_path)
        .await
        .wrap_err("Configuration parsing failed")?;
    println!("✅ Configuration parsing: OK");

    if let Err(e) = ServerConfigValidator::validate(&config) {
        eprintln!("❌ Configuration validation failed:");
        eprintln!("{e}");
        println!();
        println!("💡 Common fixes:");
        println!("   • Ensure destination addresses start with http:// or https://");
        println!("   • Check that every route's cluster_id names a configured cluster");
        println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
        println!("   • Ensure durations use humantime units (ms, s, m, h)");
        return Err(eyre!("configuration is invalid"));
    }

    let snapshot = SnapshotBuilder::new(&config, 0)
        .build()
        .map_err(|e| eyre!("Configuration rejected: {e}"))?;
    println!("✅ Configuration validation: OK");
    println!();
    println!("📋 Configuration Summary:");
    println!("   • Listen Address: {}", config.listen_addr);
    println!("   • Routes: {}", snapshot.routes().len());
    println!("   • Aggregates: {}", snapshot.aggregates().len());
    println!("   • Clusters: {}", snapshot.clusters().len());
    println!(
        "   • Health Checked Clusters: {}",
        snapshot
            .clusters()
            .values()
            .filter(|cluster| cluster.health_check.as_ref().is_some_and(|hc| hc.enabled))
            .count()
    );
    println!();
    println!("🎉 Configuration is valid and ready to use!");
    Ok(())
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        bail!("Configuration file '{config_path}' already exists");
    }

    let default_config = r#"# Portico API Gateway Configuration

# The address to listen on
listen_addr = "127.0.0.1:8080"

[global]
request_id_key = "X-Request-Id"

[resilience_policies.default]
timeout = "10s"
failure_threshold = 5
failure_window = "30s"
break_duration = "5s"
retry_count = 1

# Forward /api/<anything> to the users cluster as /<anything>
[[routes]]
id = "users"
key = "users"
upstream_path_template = "/api/users/{everything}"
downstream_path_template = "/users/{everything}"
cluster_id = "users"
resilience_policy = "default"

[[routes.request_headers]]
name = "X-Forwarded-For"
value = "{RemoteIpAddress}"

# Example aggregate combining several keyed routes
# [[aggregates]]
# upstream_path_template = "/dashboard"
# route_keys = ["users", "orders"]
# tolerate_partial_results = true

[clusters.users.load_balancer]
policy = "round_robin"

[clusters.users.health_check]
interval_secs = 10
path = "/health"

[clusters.users.destinations.one]
address = "http://localhost:3001"

[clusters.users.destinations.two]
address = "http://localhost:3002"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'portico serve --config {config_path}' to start the server");
    Ok(())
}
