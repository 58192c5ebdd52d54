use crate::config::Config;
use crate::engine::ProxyEngine;
use crate::error::ProxyError;
use crate::gate::{full_body, AccessGate, ProxyBody, RequestHandler};
use crate::upstream::UpstreamProxy;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;

/// Owns the listening socket and the handler chain (access gate wrapping the
/// proxy engine) and coordinates graceful shutdown. Binding or upstream
/// configuration failures are fatal before any request is served.
pub struct ProxyServer {
    listener: TcpListener,
    handler: Arc<AccessGate<ProxyEngine>>,
    tunnels: TaskTracker,
    shutdown_timeout: Duration,
}

impl ProxyServer {
    pub async fn bind(config: &Config) -> Result<Self, ProxyError> {
        let credentials = config.client_credentials()?;
        let upstream = UpstreamProxy::from_config(config)?;
        let tunnels = TaskTracker::new();
        let engine = ProxyEngine::new(
            upstream.clone(),
            Duration::from_secs(config.connect_timeout_secs),
            tunnels.clone(),
        );
        let handler = Arc::new(AccessGate::new(credentials.clone(), engine));

        let listener = TcpListener::bind(config.listen_addr).await.map_err(|e| {
            ProxyError::Connection(format!("Failed to bind {}: {}", config.listen_addr, e))
        })?;

        info!(
            "Forward proxy listening on {} (auth: {}:******), chaining to {}",
            config.listen_addr,
            credentials.username,
            upstream.addr()
        );

        Ok(Self {
            listener,
            handler,
            tunnels,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Accept connections until the shutdown future resolves, then stop
    /// accepting and wait up to the shutdown timeout for in-flight requests
    /// and tunnels to drain.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ProxyError> {
        let ProxyServer {
            listener,
            handler,
            tunnels,
            shutdown_timeout,
        } = self;

        let graceful = GracefulShutdown::new();
        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .preserve_header_case(true)
            .title_case_headers(true);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let handler = handler.clone();
                            let io = TokioIo::new(stream);
                            let conn = builder.serve_connection_with_upgrades(io, service_fn(move |req| {
                                let handler = handler.clone();
                                async move {
                                    Ok::<_, Infallible>(dispatch(handler, req).await)
                                }
                            }));
                            let watched = graceful.watch(conn.into_owned());
                            tokio::spawn(async move {
                                if let Err(err) = watched.await {
                                    debug!("Connection from {} ended: {}", peer, err);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, draining connections...");
                    break;
                }
            }
        }

        // Close the listening socket first so new connections are refused
        // while in-flight work drains.
        drop(listener);
        tunnels.close();

        let drained = timeout(shutdown_timeout, async {
            graceful.shutdown().await;
            tunnels.wait().await;
        })
        .await;

        match drained {
            Ok(()) => {
                info!("All connections drained, server stopped");
                Ok(())
            }
            Err(_) => {
                error!(
                    "Graceful shutdown did not complete within {:?}, dropping remaining connections",
                    shutdown_timeout
                );
                Err(ProxyError::ShutdownTimeout)
            }
        }
    }
}

async fn dispatch<H>(handler: Arc<H>, req: Request<Incoming>) -> Response<ProxyBody>
where
    H: RequestHandler<Incoming>,
{
    match handler.handle(req).await {
        Ok(response) => response,
        Err(e) => {
            // Surface upstream/relay failures as an ordinary proxy failure;
            // the error detail stays in the logs, not in the response.
            warn!("Proxy error: {}", e);
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(full_body("Proxy Error"))
                .unwrap()
        }
    }
}
