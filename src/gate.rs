use crate::auth::{validate_basic, Credentials};
use crate::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Request, Response, StatusCode};

/// Body type every handler in the chain produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// The `handle(request) -> response` capability. The gate wraps any handler
/// implementing this, which also lets it be unit-tested against a stub engine.
#[async_trait]
pub trait RequestHandler<B>: Send + Sync
where
    B: Send + 'static,
{
    async fn handle(&self, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>;
}

/// Middleware enforcing Basic proxy authentication on every inbound request,
/// CONNECT included, before any proxying occurs. Unauthenticated CONNECT
/// establishment would be an open relay.
pub struct AccessGate<H> {
    credentials: Credentials,
    inner: H,
}

impl<H> AccessGate<H> {
    pub fn new(credentials: Credentials, inner: H) -> Self {
        Self { credentials, inner }
    }

    fn challenge() -> Result<Response<ProxyBody>, ProxyError> {
        Ok(Response::builder()
            .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            .header(
                PROXY_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"Proxy Required\""),
            )
            .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(full_body("Proxy authentication required"))?)
    }
}

#[async_trait]
impl<H, B> RequestHandler<B> for AccessGate<H>
where
    H: RequestHandler<B>,
    B: Send + 'static,
{
    async fn handle(&self, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError> {
        let presented = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        if !validate_basic(presented, &self.credentials) {
            return Self::challenge();
        }

        self.inner.handle(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Stub engine that counts how often it is invoked.
    struct StubEngine {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RequestHandler<ProxyBody> for StubEngine {
        async fn handle(
            &self,
            _req: Request<ProxyBody>,
        ) -> Result<Response<ProxyBody>, ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Response::new(full_body("reached engine")))
        }
    }

    fn gate_with_counter() -> (AccessGate<StubEngine>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = AccessGate::new(
            Credentials::new("user".to_string(), "pass".to_string()),
            StubEngine {
                calls: calls.clone(),
            },
        );
        (gate, calls)
    }

    fn request(auth: Option<&str>) -> Request<ProxyBody> {
        let mut builder = Request::builder().uri("http://example.com/");
        if let Some(value) = auth {
            builder = builder.header(PROXY_AUTHORIZATION, value);
        }
        builder.body(empty_body()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_header_is_challenged_and_engine_never_invoked() {
        let (gate, calls) = gate_with_counter();
        let resp = gate.handle(request(None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            resp.headers().get(PROXY_AUTHENTICATE).unwrap(),
            "Basic realm=\"Proxy Required\""
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bad_credentials_are_challenged() {
        let (gate, calls) = gate_with_counter();
        let resp = gate
            .handle(request(Some("Basic bm90OnJpZ2h0")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_valid_credentials_reach_the_engine() {
        let (gate, calls) = gate_with_counter();
        let header = Credentials::new("user".to_string(), "pass".to_string()).basic_header();
        let resp = gate.handle(request(Some(&header))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_requests_are_challenged_too() {
        let (gate, calls) = gate_with_counter();
        let req = Request::builder()
            .method(hyper::Method::CONNECT)
            .uri("example.com:443")
            .body(empty_body())
            .unwrap();
        let resp = gate.handle(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_challenge_does_not_leak_expected_credentials() {
        let (gate, _) = gate_with_counter();
        let resp = gate.handle(request(None)).await.unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("user"));
        assert!(!text.contains("pass"));
    }
}
