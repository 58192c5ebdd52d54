use chaingate::{Config, ProxyError, ProxyServer};
use clap::Parser;
use log::info;
use std::net::SocketAddr;
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Authenticating HTTP/HTTPS forward proxy that chains to an authenticated upstream proxy"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (default: 0.0.0.0:3128)")]
    listen: Option<SocketAddr>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path (JSON)")]
    config: Option<String>,

    #[clap(long, value_name = "USERNAME", help = "Username clients must present (Basic auth)")]
    proxy_username: Option<String>,

    #[clap(long, value_name = "PASSWORD", help = "Password clients must present (Basic auth)")]
    proxy_password: Option<String>,

    #[clap(long, value_name = "URL", help = "Upstream proxy URL (e.g., http://user:pass@gw:8080)")]
    upstream_url: Option<String>,

    #[clap(long, value_name = "USERNAME", help = "Upstream proxy username (overrides URL userinfo)")]
    upstream_username: Option<String>,

    #[clap(long, value_name = "PASSWORD", help = "Upstream proxy password (overrides URL userinfo)")]
    upstream_password: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Upstream connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Graceful shutdown timeout in seconds")]
    shutdown_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), ProxyError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let server = ProxyServer::bind(&config).await?;
    server.run(shutdown_signal()).await?;

    info!("Proxy server stopped");
    Ok(())
}

/// Config file (if given) or environment variables, with CLI flags overriding
/// either.
fn load_config(args: &Args) -> Result<Config, ProxyError> {
    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(ProxyError::Config(format!(
                "Configuration file not found: {}",
                config_file
            )));
        }
        Config::from_file(config_file)?
    } else {
        Config::from_env()?
    };

    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if args.proxy_username.is_some() {
        config.proxy_username = args.proxy_username.clone();
    }
    if args.proxy_password.is_some() {
        config.proxy_password = args.proxy_password.clone();
    }
    if args.upstream_url.is_some() {
        config.upstream_url = args.upstream_url.clone();
    }
    if args.upstream_username.is_some() {
        config.upstream_username = args.upstream_username.clone();
    }
    if args.upstream_password.is_some() {
        config.upstream_password = args.upstream_password.clone();
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = secs;
    }
    if let Some(secs) = args.shutdown_timeout {
        config.shutdown_timeout_secs = secs;
    }

    Ok(config)
}

/// Resolves on SIGINT or SIGTERM; no other signals are handled.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}
