use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    pub upstream: UpstreamConfig,
    pub resolver: ResolverConfig,
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the public SSH listener (e.g. `0.0.0.0:10022`).
    #[serde(default = "default_ssh_listen")]
    pub ssh_listen: String,
    /// Socket address for the admin HTTP listener serving `/healthz` and
    /// `/metrics`.  Disabled when absent.
    #[serde(default)]
    pub http_listen: Option<String>,
}

fn default_ssh_listen() -> String {
    "0.0.0.0:10022".to_string()
}

// ---------------------------------------------------------------------------
// SSH server side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Identification string advertised to clients and backends.
    #[serde(default = "default_server_version")]
    pub server_version: String,
    /// The only username accepted from clients.
    #[serde(default = "default_username")]
    pub username: String,
    /// Name of the `env` variable that carries the project name.
    #[serde(default = "default_routing_env_var")]
    pub routing_env_var: String,
    /// How long (seconds) a channel may take to name its project.
    #[serde(default = "default_env_timeout")]
    pub env_timeout_secs: u64,
    /// Delay (seconds) before retrying after a transient accept error.
    #[serde(default = "default_accept_retry_delay")]
    pub accept_retry_delay_secs: u64,
    /// Where the SSH host key comes from.
    #[serde(default)]
    pub host_key: SecretSource,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            server_version: default_server_version(),
            username: default_username(),
            routing_env_var: default_routing_env_var(),
            env_timeout_secs: default_env_timeout(),
            accept_retry_delay_secs: default_accept_retry_delay(),
            host_key: SecretSource::default(),
        }
    }
}

impl SshConfig {
    pub fn env_timeout(&self) -> Duration {
        Duration::from_secs(self.env_timeout_secs)
    }

    pub fn accept_retry_delay(&self) -> Duration {
        Duration::from_secs(self.accept_retry_delay_secs)
    }
}

fn default_server_version() -> String {
    "SSH-2.0-SshRouter".to_string()
}

fn default_username() -> String {
    "project".to_string()
}

fn default_routing_env_var() -> String {
    "ROUTE_PROJECT".to_string()
}

fn default_env_timeout() -> u64 {
    15
}

fn default_accept_retry_delay() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Where a secret (a private key or the API shared secret) is kept: a file
/// on disk or a Linux kernel keyring entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SecretSource {
    /// Path to the file holding the secret.
    #[serde(default)]
    pub path: Option<String>,
    /// Description of a `user` key in the session or user keyring.
    #[serde(default)]
    pub keyring: Option<String>,
}

impl SecretSource {
    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.keyring.is_none()
    }
}

// ---------------------------------------------------------------------------
// Upstream (SSH client side)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// The proxy-wide client identity presented to every backend.
    pub client_key: SecretSource,
    /// Username used towards backends.  Defaults to `ssh.username`.
    #[serde(default)]
    pub username: Option<String>,
    /// Upper bound (seconds) on dialing a backend.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// SHA-256 host key fingerprints (`SHA256:...`) backends may present.
    /// Empty means any host key is accepted.
    #[serde(default)]
    pub known_host_fingerprints: Vec<String>,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_connect_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResolverConfig {
    /// Ask the platform API.
    Http(HttpResolverConfig),
    /// Fixed table from this file.
    Static(StaticResolverConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpResolverConfig {
    /// Base URL of the platform API (e.g. `http://localhost:8000`).
    pub api_url: String,
    /// Where the API shared secret is kept.  Lookups are unauthenticated
    /// when neither a path nor a keyring entry is set.
    #[serde(default)]
    pub shared_secret: SecretSource,
    /// Header carrying the shared secret on every lookup.
    #[serde(default = "default_shared_secret_header")]
    pub shared_secret_header: String,
    /// Per-lookup timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_shared_secret_header() -> String {
    "X-Horizon-Cloud-Shared-Secret".to_string()
}

fn default_request_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticResolverConfig {
    /// `project name → host:port`.
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.ssh.username.is_empty(), "ssh.username must not be empty");
    anyhow::ensure!(
        !config.ssh.routing_env_var.is_empty(),
        "ssh.routing_env_var must not be empty"
    );
    anyhow::ensure!(config.ssh.env_timeout_secs > 0, "ssh.env_timeout_secs must be > 0");
    anyhow::ensure!(
        config.ssh.server_version.starts_with("SSH-2.0-"),
        "ssh.server_version must start with `SSH-2.0-`"
    );
    anyhow::ensure!(
        !config.upstream.client_key.is_empty(),
        "upstream.client_key needs a path or a keyring entry"
    );
    match &config.resolver {
        ResolverConfig::Http(http) => {
            anyhow::ensure!(!http.api_url.is_empty(), "resolver.api_url must not be empty");
            anyhow::ensure!(
                !http.shared_secret_header.is_empty(),
                "resolver.shared_secret_header must not be empty"
            );
        }
        ResolverConfig::Static(table) => {
            for (project, address) in &table.routes {
                anyhow::ensure!(
                    !address.is_empty(),
                    "resolver.routes.{project} has an empty address"
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
proxy: {}
upstream:
  client_key: { path: /secrets/client }
resolver:
  kind: static
  routes:
    demo: "10.0.0.5:22"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.proxy.ssh_listen, "0.0.0.0:10022");
        assert!(config.proxy.http_listen.is_none());
        assert_eq!(config.ssh.username, "project");
        assert_eq!(config.ssh.routing_env_var, "ROUTE_PROJECT");
        assert_eq!(config.ssh.env_timeout(), Duration::from_secs(15));
        assert_eq!(config.ssh.accept_retry_delay(), Duration::from_secs(5));
        assert_eq!(config.upstream.connect_timeout(), Duration::from_secs(10));
        assert!(config.upstream.username.is_none());
        match config.resolver {
            ResolverConfig::Static(table) => {
                assert_eq!(table.routes.get("demo").map(String::as_str), Some("10.0.0.5:22"));
            }
            other => panic!("unexpected resolver: {other:?}"),
        }
    }

    #[test]
    fn http_resolver_config() {
        let yaml = r#"
proxy:
  ssh_listen: "127.0.0.1:2222"
  http_listen: "127.0.0.1:9100"
ssh:
  username: horizon
  routing_env_var: HZ_PROJECT
  host_key: { keyring: "ssh-router:host_key" }
upstream:
  client_key: { keyring: "ssh-router:client_key" }
  username: deploy
resolver:
  kind: http
  api_url: "http://api:8000"
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.ssh.username, "horizon");
        assert_eq!(config.ssh.host_key.keyring.as_deref(), Some("ssh-router:host_key"));
        assert_eq!(config.upstream.username.as_deref(), Some("deploy"));
        match config.resolver {
            ResolverConfig::Http(http) => {
                assert_eq!(http.api_url, "http://api:8000");
                assert!(http.shared_secret.is_empty());
                assert_eq!(http.shared_secret_header, "X-Horizon-Cloud-Shared-Secret");
                assert_eq!(http.request_timeout_secs, 5);
            }
            other => panic!("unexpected resolver: {other:?}"),
        }
    }

    #[test]
    fn shared_secret_from_a_file() {
        let yaml = r#"
proxy: {}
upstream:
  client_key: { path: /secrets/client }
resolver:
  kind: http
  api_url: "http://api:8000"
  shared_secret: { path: /secrets/api }
  shared_secret_header: X-Api-Secret
"#;
        let config = parse_config(yaml).unwrap();
        match config.resolver {
            ResolverConfig::Http(http) => {
                assert_eq!(http.shared_secret.path.as_deref(), Some("/secrets/api"));
                assert_eq!(http.shared_secret_header, "X-Api-Secret");
            }
            other => panic!("unexpected resolver: {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_timeout() {
        let yaml = MINIMAL.replace("proxy: {}", "proxy: {}\nssh:\n  env_timeout_secs: 0");
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn rejects_bad_server_version() {
        let yaml = MINIMAL.replace("proxy: {}", "proxy: {}\nssh:\n  server_version: Router");
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn rejects_missing_client_key() {
        let yaml = MINIMAL.replace("{ path: /secrets/client }", "{}");
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn rejects_empty_static_address() {
        let yaml = MINIMAL.replace("\"10.0.0.5:22\"", "\"\"");
        assert!(parse_config(&yaml).is_err());
    }
}
