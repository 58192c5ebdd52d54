use crate::auth::Credentials;
use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:3128".parse().unwrap()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

/// Process-wide configuration, read once at startup and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the proxy listens on for client connections
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Username clients must present via Proxy-Authorization
    pub proxy_username: Option<String>,

    /// Password clients must present via Proxy-Authorization
    pub proxy_password: Option<String>,

    /// URL of the upstream proxy every request is chained through
    pub upstream_url: Option<String>,

    /// Username for the upstream proxy (overrides URL-embedded userinfo)
    pub upstream_username: Option<String>,

    /// Password for the upstream proxy (overrides URL-embedded userinfo)
    pub upstream_password: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            proxy_username: None,
            proxy_password: None,
            upstream_url: None,
            upstream_username: None,
            upstream_password: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Invalid configuration file: {}", e)))
    }

    /// Reads the original deployment's environment surface: PROXY_USER,
    /// PROXY_PASS, PROXY_UPSTREAM_URL plus the optional PROXY_UPSTREAM_USER,
    /// PROXY_UPSTREAM_PASS and PROXY_LISTEN_ADDR.
    pub fn from_env() -> Result<Self, ProxyError> {
        let mut config = Config::default();
        if let Ok(addr) = std::env::var("PROXY_LISTEN_ADDR") {
            config.listen_addr = addr
                .parse()
                .map_err(|e| ProxyError::Config(format!("Invalid PROXY_LISTEN_ADDR: {}", e)))?;
        }
        config.proxy_username = std::env::var("PROXY_USER").ok();
        config.proxy_password = std::env::var("PROXY_PASS").ok();
        config.upstream_url = std::env::var("PROXY_UPSTREAM_URL").ok();
        config.upstream_username = std::env::var("PROXY_UPSTREAM_USER").ok();
        config.upstream_password = std::env::var("PROXY_UPSTREAM_PASS").ok();
        Ok(config)
    }

    /// Credentials the client population must present. Missing credentials are
    /// a startup failure, not a per-request one.
    pub fn client_credentials(&self) -> Result<Credentials, ProxyError> {
        match (&self.proxy_username, &self.proxy_password) {
            (Some(username), Some(password)) => {
                Ok(Credentials::new(username.clone(), password.clone()))
            }
            _ => Err(ProxyError::Config(
                "Client credentials are required (proxy_username / proxy_password)".to_string(),
            )),
        }
    }

    pub fn upstream_url(&self) -> Result<&str, ProxyError> {
        self.upstream_url.as_deref().ok_or_else(|| {
            ProxyError::Config("Upstream proxy URL is required (upstream_url)".to_string())
        })
    }
}
