pub mod auth;
pub mod config;
pub mod conn;
pub mod error;
pub mod logging;
pub mod request;
pub mod server;
pub mod tunnel;

pub use auth::Credential;
pub use config::Config;
pub use error::ProxyError;
pub use logging::LogSink;
pub use server::Server;
