use clap::Parser;
use serde::Deserialize;
use std::{
    collections::HashSet,
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{SubgraphEntry, error::ConfigError};

/// Command line arguments of the gateway binary.
#[derive(Debug, Parser)]
#[command(name = "portkey-gateway", version, about)]
pub struct Args {
    /// Path to the gateway YAML configuration
    #[arg(short, long, env = "PORTKEY_CONFIG", default_value = "gateway.yaml")]
    pub config: PathBuf,

    /// Address to listen on, overrides `server.listen`
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Include error details in GraphQL error responses
    #[arg(long)]
    pub debug: bool,
}

/// Everything the gateway needs at startup.
#[derive(Clone, Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub gateway: GatewaySettings,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub path: String,
    pub cors: bool,
    pub debug: bool,
    pub landing_page: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3000)),
            path: "/graphql".to_string(),
            cors: true,
            debug: false,
            landing_page: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GatewaySettings {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    pub subgraphs: Vec<SubgraphEntry>,
}

fn default_request_timeout() -> u64 {
    30
}

impl GatewaySettings {
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl GatewayConfig {
    /// Config with default server settings and the given subgraphs.
    pub fn with_subgraphs(subgraphs: Vec<SubgraphEntry>) -> Self {
        GatewayConfig {
            server: ServerConfig::default(),
            gateway: GatewaySettings {
                debug: false,
                poll_interval_secs: None,
                request_timeout_secs: default_request_timeout(),
                subgraphs,
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::info!("Reading gateway config from {}", path.display());
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command line overrides on top of the file contents.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = args.listen {
            self.server.listen = listen;
        }
        if args.debug {
            self.server.debug = true;
            self.gateway.debug = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.server.path.clone()));
        }
        validate_subgraphs(&self.gateway.subgraphs)
    }
}

/// Subgraph names must be unique and every url must be an absolute http(s) url.
pub fn validate_subgraphs(subgraphs: &[SubgraphEntry]) -> Result<(), ConfigError> {
    if subgraphs.is_empty() {
        return Err(ConfigError::NoSubgraphs);
    }

    let mut seen = HashSet::new();
    for subgraph in subgraphs {
        if !seen.insert(subgraph.name.as_str()) {
            return Err(ConfigError::DuplicateSubgraph(subgraph.name.clone()));
        }

        let valid = reqwest::Url::parse(&subgraph.url)
            .map(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
            .unwrap_or(false);
        if !valid {
            return Err(ConfigError::InvalidUrl {
                name: subgraph.name.clone(),
                url: subgraph.url.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
gateway:
  subgraphs:
    - name: bookmarks
      url: http://localhost:3001/graphql
    - name: categories
      url: http://localhost:3002/graphql
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = GatewayConfig::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.server.path, "/graphql");
        assert_eq!(config.server.listen.port(), 3000);
        assert!(config.server.cors);
        assert!(!config.server.debug);
        assert!(!config.gateway.debug);
        assert_eq!(config.gateway.poll_interval(), None);
        assert_eq!(config.gateway.request_timeout(), Duration::from_secs(30));

        let names: Vec<_> = config
            .gateway
            .subgraphs
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["bookmarks", "categories"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let yaml = r#"
gateway:
  subgraphs:
    - name: users
      url: http://localhost:3006/graphql
    - name: users
      url: http://localhost:3007/graphql
"#;
        let err = GatewayConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateSubgraph(name) if name == "users"));
    }

    #[test]
    fn relative_urls_are_rejected() {
        let yaml = r#"
gateway:
  subgraphs:
    - name: users
      url: /graphql
"#;
        let err = GatewayConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn empty_registry_is_rejected() {
        let yaml = "gateway:\n  subgraphs: []\n";
        assert!(matches!(
            GatewayConfig::from_yaml(yaml),
            Err(ConfigError::NoSubgraphs)
        ));
    }

    #[test]
    fn path_must_be_absolute() {
        let yaml = format!("server:\n  path: graphql\n{}", MINIMAL.trim_start());
        assert!(matches!(
            GatewayConfig::from_yaml(&yaml),
            Err(ConfigError::InvalidPath(_))
        ));
    }

    #[test]
    fn zero_poll_interval_disables_polling() {
        let mut config = GatewayConfig::from_yaml(MINIMAL).unwrap();
        config.gateway.poll_interval_secs = Some(0);
        assert_eq!(config.gateway.poll_interval(), None);
        config.gateway.poll_interval_secs = Some(10);
        assert_eq!(config.gateway.poll_interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn cli_overrides_listen_and_debug() {
        let mut config = GatewayConfig::from_yaml(MINIMAL).unwrap();
        let args = Args::parse_from(["portkey-gateway", "--listen", "127.0.0.1:4000", "--debug"]);
        config.apply_args(&args);

        assert_eq!(config.server.listen, "127.0.0.1:4000".parse().unwrap());
        assert!(config.server.debug);
        assert!(config.gateway.debug);
    }

    #[test]
    fn shipped_config_registers_every_subgraph() {
        let config = GatewayConfig::from_yaml(include_str!("../gateway.yaml")).unwrap();
        assert_eq!(config.gateway.subgraphs.len(), 7);
        assert_eq!(config.gateway.subgraphs[6].name, "counters");
    }
}
