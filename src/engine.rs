use crate::error::ProxyError;
use crate::gate::{empty_body, ProxyBody, RequestHandler};
use crate::upstream::UpstreamProxy;
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HOST, PROXY_AUTHORIZATION};
use hyper::http::uri::Authority;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;

const MAX_CONNECT_RESPONSE_HEAD: usize = 8 * 1024;

/// The request/tunnel relay core. Plain HTTP requests are replayed to the
/// upstream proxy in absolute form with the upstream credential attached;
/// CONNECT requests become opaque byte tunnels through the same upstream.
pub struct ProxyEngine {
    upstream: UpstreamProxy,
    connect_timeout: Duration,
    tunnels: TaskTracker,
}

impl ProxyEngine {
    pub fn new(upstream: UpstreamProxy, connect_timeout: Duration, tunnels: TaskTracker) -> Self {
        Self {
            upstream,
            connect_timeout,
            tunnels,
        }
    }

    /// Dial the upstream proxy once. No retries: a failure here surfaces to
    /// the requesting client.
    async fn dial_upstream(&self) -> Result<TcpStream, ProxyError> {
        let addr = self.upstream.addr();
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                ProxyError::Connection(format!("Timed out connecting to upstream proxy {}", addr))
            })?
            .map_err(|e| {
                ProxyError::Connection(format!("Failed to connect to upstream proxy {}: {}", addr, e))
            })?;
        Ok(stream)
    }

    async fn forward_http(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let target_uri = extract_target_uri(&req)?;
        debug!(
            "Forwarding {} {} via upstream proxy",
            req.method(),
            target_uri
        );

        // The upstream leg gets the absolute-form target and its own
        // credential; client-leg hop-by-hop headers stay behind.
        *req.uri_mut() = target_uri;
        strip_hop_by_hop_headers(req.headers_mut());
        let upstream = self.upstream.target_for(&req);
        if let Some(auth) = upstream.auth() {
            req.headers_mut().insert(PROXY_AUTHORIZATION, auth.clone());
        }

        let stream = self.dial_upstream().await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("Upstream connection closed: {}", err);
            }
        });

        let mut response = sender.send_request(req).await?;
        debug!("Upstream responded {}", response.status());
        // The upstream leg's hop-by-hop headers stop here as well.
        strip_hop_by_hop_headers(response.headers_mut());
        Ok(response.map(|body| body.boxed()))
    }

    async fn handle_connect(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let Some(authority) = req.uri().authority().cloned() else {
            warn!("CONNECT request without host:port target");
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(empty_body())?);
        };

        let mut upstream_stream = self.dial_upstream().await?;
        let (status, early) = timeout(
            self.connect_timeout,
            self.relay_connect(&mut upstream_stream, &authority),
        )
        .await
        .map_err(|_| {
            ProxyError::Connection(format!(
                "Timed out waiting for upstream CONNECT response for {}",
                authority
            ))
        })??;

        if !status.is_success() {
            // The upstream refused the tunnel; hand its verdict to the client
            // instead of pretending the tunnel exists.
            info!("Upstream proxy refused CONNECT to {}: {}", authority, status);
            return Ok(Response::builder().status(status).body(empty_body())?);
        }

        let target = authority.to_string();
        self.tunnels.spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    // Tunnel bytes the upstream coalesced with its response
                    // head belong to the client.
                    if !early.is_empty() {
                        if let Err(e) = client.write_all(&early).await {
                            debug!("Tunnel to {} ended: {}", target, e);
                            return;
                        }
                    }
                    match tokio::io::copy_bidirectional(&mut client, &mut upstream_stream).await {
                        Ok((up, down)) => {
                            debug!("Tunnel to {} closed ({} bytes up, {} bytes down)", target, up, down)
                        }
                        Err(e) => debug!("Tunnel to {} ended: {}", target, e),
                    }
                }
                Err(e) => warn!("Connection upgrade failed for {}: {}", target, e),
            }
        });

        // 200 tells the client the tunnel is up; the upgrade completes once
        // this response has been written.
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())?)
    }

    /// Send our own CONNECT for the original target to the upstream proxy and
    /// return the status it answered with, plus any tunnel bytes read past
    /// the response head.
    async fn relay_connect(
        &self,
        stream: &mut TcpStream,
        authority: &Authority,
    ) -> Result<(StatusCode, Vec<u8>), ProxyError> {
        let mut head = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", authority);
        if let Some(auth) = self.upstream.auth() {
            head.push_str(&format!(
                "Proxy-Authorization: {}\r\n",
                String::from_utf8_lossy(auth.as_bytes())
            ));
        }
        head.push_str("\r\n");

        stream.write_all(head.as_bytes()).await?;
        stream.flush().await?;

        let mut buf = Vec::with_capacity(512);
        let mut chunk = [0u8; 512];
        let head_end = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProxyError::Connection(
                    "Upstream proxy closed the connection during CONNECT".to_string(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_head_end(&buf) {
                break end;
            }
            if buf.len() > MAX_CONNECT_RESPONSE_HEAD {
                return Err(ProxyError::Http(
                    "Upstream CONNECT response head too large".to_string(),
                ));
            }
        };

        let status = parse_connect_status(&buf[..head_end])?;
        let early = buf.split_off(head_end);
        Ok((status, early))
    }
}

#[async_trait]
impl RequestHandler<Incoming> for ProxyEngine {
    async fn handle(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.forward_http(req).await
        }
    }
}

/// Position just past the `\r\n\r\n` terminating a response head, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse the status code out of an HTTP/1.x response head such as
/// `HTTP/1.1 200 Connection Established`.
fn parse_connect_status(head: &[u8]) -> Result<StatusCode, ProxyError> {
    let text = String::from_utf8_lossy(head);
    let status_line = text.lines().next().unwrap_or("");
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(ProxyError::Http(format!(
            "Upstream proxy sent a non-HTTP CONNECT response: {}",
            status_line
        )));
    }
    let code = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            ProxyError::Http(format!(
                "Upstream proxy sent an unparsable CONNECT status line: {}",
                status_line
            ))
        })?;
    StatusCode::from_u16(code)
        .map_err(|_| ProxyError::Http(format!("Upstream proxy sent invalid status {}", code)))
}

/// Resolve the absolute target of a plain proxied request. Proxy clients send
/// absolute-form request lines; origin-form requests fall back to the Host
/// header.
fn extract_target_uri<B>(req: &Request<B>) -> Result<Uri, ProxyError> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ProxyError::Uri("Cannot determine target URI".to_string()))?;
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("http://{}{}", host, path)
        .parse::<Uri>()
        .map_err(|e| ProxyError::Uri(e.to_string()))
}

/// Headers tied to the client-facing leg must not travel to the next hop.
/// The upstream leg grows its own Proxy-Authorization separately.
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    headers.remove(hyper::header::CONNECTION);
    headers.remove("Proxy-Connection");
    headers.remove("Keep-Alive");
    headers.remove(hyper::header::PROXY_AUTHENTICATE);
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove(hyper::header::TE);
    headers.remove(hyper::header::TRAILER);
    headers.remove(hyper::header::TRANSFER_ENCODING);
    headers.remove(hyper::header::UPGRADE);
}
