pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod server;
pub mod upstream;

pub use config::Config;
pub use error::ProxyError;
pub use server::ProxyServer;
