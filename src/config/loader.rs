use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(server_config)
}

/// Parse a configuration document held in memory (used by remote providers).
pub fn parse_config_str(content: &str, format: FileFormat) -> Result<ServerConfig> {
    Config::builder()
        .add_source(File::from_str(content, format))
        .build()
        .wrap_err("Failed to build config from string")?
        .try_deserialize()
        .wrap_err("Failed to deserialize config from string")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::LoadBalancerConfig;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
global:
  request_id_key: "x-request-id"
routes:
  - upstream_path_template: "/users/{id}"
    downstream_path_template: "/api/users/{id}"
    upstream_methods: ["GET"]
    cluster_id: "users"
    request_headers:
      - name: "X-Forwarded-For"
        value: "{RemoteIpAddress}"
clusters:
  users:
    load_balancer:
      policy: "least_connection"
    destinations:
      one:
        address: "http://backend:8080"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].request_headers[0].value, "{RemoteIpAddress}");
        assert_eq!(
            config.clusters["users"].load_balancer,
            LoadBalancerConfig::LeastConnection
        );
        assert_eq!(config.global.request_id_key.as_deref(), Some("x-request-id"));
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "routes": [
    { "upstream_path_template": "/", "cluster_id": "main", "key": "root" }
  ],
  "aggregates": [
    { "upstream_path_template": "/both", "route_keys": ["root"] }
  ],
  "clusters": {
    "main": {
      "destinations": { "one": { "address": "http://backend:8080", "weight": 3 } }
    }
  }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.aggregates[0].route_keys, vec!["root".to_string()]);
        assert!(!config.aggregates[0].tolerate_partial_results);
        assert_eq!(config.clusters["main"].destinations["one"].weight, 3);
        assert_eq!(config.clusters["main"].load_balancer, LoadBalancerConfig::RoundRobin);
    }

    #[test]
    fn test_parse_toml_with_policies() {
        let toml_content = r#"
listen_addr = "127.0.0.1:3000"

[resilience_policies.strict]
failure_threshold = 2
break_duration = "1s"
timeout = "500ms"
retry_count = 2

[[routes]]
upstream_path_template = "/orders/{everything}"
cluster_id = "orders"
resilience_policy = "strict"

[clusters.orders.load_balancer]
policy = "sticky"
key = "session"

[clusters.orders.destinations.a]
address = "http://localhost:7001"
"#;

        let config = parse_config_str(toml_content, FileFormat::Toml).unwrap();
        let policy = &config.resilience_policies["strict"];
        assert_eq!(policy.failure_threshold, 2);
        assert_eq!(policy.retry_count, 2);
        // unspecified fields keep their defaults
        assert_eq!(policy.retry_methods, vec!["GET".to_string(), "HEAD".to_string()]);
        assert_eq!(
            config.clusters["orders"].load_balancer,
            LoadBalancerConfig::Sticky {
                key: "session".to_string(),
                expiry: "30m".to_string()
            }
        );
    }
}
