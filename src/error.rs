use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("URI error: {0}")]
    Uri(String),

    #[error("Hyper error: {0}")]
    Hyper(String),

    #[error("Graceful shutdown timed out")]
    ShutdownTimeout,
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Hyper(err.to_string())
    }
}

impl From<http::Error> for ProxyError {
    fn from(err: http::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}
