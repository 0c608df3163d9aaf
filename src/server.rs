use crate::auth::Credential;
use crate::config::Config;
use crate::conn::{Connection, HandlerContext};
use crate::error::ProxyError;
use crate::logging::LogSink;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Pause after a failed accept, so descriptor exhaustion does not spin the loop.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// The listening proxy. Immutable once built; each accepted client is served
/// on its own task with a shared, read-only [`HandlerContext`].
#[derive(Debug)]
pub struct Server {
    addr: String,
    context: Arc<HandlerContext>,
}

impl Server {
    /// Builds the server from startup configuration. With `gen_auth` set a
    /// random credential replaces any configured one and is announced on
    /// `log`.
    pub fn new(config: &Config, log: LogSink) -> Self {
        let credential = if config.gen_auth {
            let (user_pass, credential) = Credential::generate();
            log.info(format_args!("generated credentials {}", user_pass));
            credential
        } else {
            Credential::from_user_pass(config.auth.as_deref().unwrap_or_default())
        };
        Self::with_credential(config.bind_addr(), credential, config.max_header_size, log)
    }

    pub fn with_credential(
        addr: impl Into<String>,
        credential: Credential,
        max_header_size: usize,
        log: LogSink,
    ) -> Self {
        Self {
            addr: addr.into(),
            context: Arc::new(HandlerContext {
                credential,
                max_header_size,
                log,
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn credential(&self) -> &Credential {
        &self.context.credential
    }

    /// Binds the configured address and serves until the process exits.
    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.addr.as_str())
            .await
            .map_err(|e| ProxyError::Config(format!("Failed to listen on {}: {}", self.addr, e)))?;
        self.serve(listener).await
    }

    /// Accepts clients from an already bound `listener`. Accept errors are
    /// logged and skipped; only the caller can stop the loop.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ProxyError> {
        let log = &self.context.log;
        if self.context.credential.is_required() {
            log.info(format_args!("use {} for auth", self.context.credential.encoded()));
        }
        log.info(format_args!(
            "proxy listen in {}, waiting for connection...",
            listener.local_addr()?
        ));

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    log.debug(format_args!("accepted {}", peer));
                    let conn = Connection::new(stream, peer.to_string(), Arc::clone(&self.context));
                    tokio::spawn(conn.serve());
                }
                Err(e) => self.accept_failed(e).await,
            }
        }
    }

    async fn accept_failed(&self, e: io::Error) {
        self.context.log.error(format_args!("accept: {}", e));
        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_without_auth() {
        let server = Server::new(&Config::default(), LogSink::default());
        assert_eq!(server.addr(), "0.0.0.0:8080");
        assert!(!server.credential().is_required());
    }

    #[test]
    fn test_new_with_explicit_auth() {
        let config = Config {
            listen_addr: "127.0.0.1:3128".to_string(),
            auth: Some("user:pass".to_string()),
            ..Config::default()
        };
        let server = Server::new(&config, LogSink::default());
        assert_eq!(server.addr(), "127.0.0.1:3128");
        assert_eq!(server.credential().encoded(), "dXNlcjpwYXNz");
    }

    #[test]
    fn test_generated_auth_overrides_explicit() {
        let config = Config {
            auth: Some("user:pass".to_string()),
            gen_auth: true,
            ..Config::default()
        };
        let server = Server::new(&config, LogSink::default());
        assert!(server.credential().is_required());
        assert_ne!(server.credential().encoded(), "dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn test_accept_error_backs_off() {
        let server = Server::with_credential("127.0.0.1:0", Credential::none(), 1024, LogSink::default());
        let started = std::time::Instant::now();
        server
            .accept_failed(io::Error::other("too many open files"))
            .await;
        assert!(started.elapsed() >= ACCEPT_ERROR_DELAY);
    }

    #[tokio::test]
    async fn test_run_reports_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let server = Server::with_credential(addr, Credential::none(), 1024, LogSink::default());
        assert!(matches!(server.run().await, Err(ProxyError::Config(_))));
    }
}
