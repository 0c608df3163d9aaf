//! Per-connection protocol handling.
//!
//! A connection moves through
//! `Start -> HeaderParsed -> Authorized -> OriginDialed -> Tunneling -> Closed`
//! and may leave for `Closed` from any state. Only an authentication failure
//! produces a response of the proxy's own; every other failure drops the
//! client without a reply.

use crate::auth::Credential;
use crate::error::ProxyError;
use crate::logging::LogSink;
use crate::request::{TunnelInfo, read_tunnel_info};
use crate::tunnel::{TunnelStats, tunnel};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
pub const PROXY_AUTH_REQUIRED: &[u8] =
    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"*\"\r\n\r\n";

/// Read-only settings every connection handler consults.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub credential: Credential,
    pub max_header_size: usize,
    pub log: LogSink,
}

/// One accepted client and the shared settings it is served with.
pub struct Connection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    peer: String,
    context: Arc<HandlerContext>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, peer: impl Into<String>, context: Arc<HandlerContext>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            peer: peer.into(),
            context,
        }
    }

    /// Serves the client to completion. Failures are logged, never returned;
    /// the client socket is closed when this returns.
    pub async fn serve(self) {
        let log = self.context.log.clone();
        if let Err(e) = self.run().await {
            log.error(format_args!("{}", e));
        }
    }

    async fn run(mut self) -> Result<TunnelStats, ProxyError> {
        let info = read_tunnel_info(&mut self.reader, self.context.max_header_size).await?;
        self.context.log.debug(format_args!(
            "{} requested {} (https: {})",
            self.peer, info.remote, info.is_https
        ));

        self.authorize(&info.credential).await?;

        self.context.log.info(format_args!("connecting to {}", info.remote));
        let mut origin = TcpStream::connect(info.remote.as_str())
            .await
            .map_err(|e| ProxyError::Connection(format!("dial {}: {}", info.remote, e)))?;

        self.handshake(&info, &mut origin).await?;

        let Self { reader, writer, peer, context } = self;
        let log = &context.log;
        log.info(format_args!("begin tunnel {} <-> {}", peer, info.remote));
        let (origin_reader, origin_writer) = origin.into_split();
        let stats = tunnel(reader, writer, origin_reader, origin_writer, log).await;
        log.info(format_args!(
            "stop tunnel {} <-> {} (up: {}, down: {} bytes)",
            peer,
            info.remote,
            stats.upstream.map_or_else(|| "cut".to_string(), |n| n.to_string()),
            stats.downstream
        ));
        Ok(stats)
    }

    /// Rejects the client with a 407 challenge unless `credential` passes.
    async fn authorize(&mut self, credential: &str) -> Result<(), ProxyError> {
        if self.context.credential.validate(credential) {
            return Ok(());
        }
        if let Err(e) = self.writer.write_all(PROXY_AUTH_REQUIRED).await {
            self.context.log.error(format_args!("writing 407 to {}: {}", self.peer, e));
        }
        Err(ProxyError::Auth(format!("Auth fail: {:?} from {}", credential, self.peer)))
    }

    /// Confirms a CONNECT to the client, or forwards the rebuilt request
    /// header to the origin for plain HTTP.
    async fn handshake(&mut self, info: &TunnelInfo, origin: &mut TcpStream) -> Result<(), ProxyError> {
        if info.is_https {
            self.writer.write_all(CONNECTION_ESTABLISHED).await?;
        } else {
            origin.write_all(&info.raw_header).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, duplex};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn context(credential: Credential) -> Arc<HandlerContext> {
        Arc::new(HandlerContext {
            credential,
            max_header_size: 16 * 1024,
            log: LogSink::default(),
        })
    }

    async fn origin() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    async fn read_until_blank_line(stream: &mut TcpStream) -> Vec<u8> {
        let mut received = Vec::new();
        let mut byte = [0u8; 1];
        while !received.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            received.push(byte[0]);
        }
        received
    }

    #[tokio::test]
    async fn test_connect_replies_established_and_relays() {
        let (listener, addr) = origin().await;
        let (mut client, server_side) = duplex(4096);
        let handler = tokio::spawn(Connection::new(server_side, "test", context(Credential::none())).serve());

        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", addr).as_bytes())
            .await
            .unwrap();
        let (mut upstream, _) = listener.accept().await.unwrap();

        let mut reply = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, CONNECTION_ESTABLISHED);

        client.write_all(b"\x16\x03\x01hello").await.unwrap();
        let mut buf = [0u8; 8];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x16\x03\x01hello");

        upstream.write_all(b"world").await.unwrap();
        drop(upstream);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"world");
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_http_forwards_rebuilt_header() {
        let (listener, addr) = origin().await;
        let (mut client, server_side) = duplex(4096);
        let handler = tokio::spawn(Connection::new(server_side, "test", context(Credential::none())).serve());

        client
            .write_all(format!("GET http://{}/a HTTP/1.1\r\nAccept: */*\r\n\r\n", addr).as_bytes())
            .await
            .unwrap();
        let (mut upstream, _) = listener.accept().await.unwrap();
        let forwarded = read_until_blank_line(&mut upstream).await;
        assert_eq!(
            forwarded,
            format!("GET http://{}/a HTTP/1.1\r\nAccept:*/*\r\n\r\n", addr).into_bytes()
        );

        upstream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        drop(upstream);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 204 No Content\r\n\r\n");
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_sends_407_without_dialing() {
        let (listener, addr) = origin().await;
        let (mut client, server_side) = duplex(4096);
        let handler = tokio::spawn(
            Connection::new(server_side, "test", context(Credential::from_user_pass("user:pass"))).serve(),
        );

        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\nProxy-Authorization: Basic bm9wZQ==\r\n\r\n", addr).as_bytes())
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, PROXY_AUTH_REQUIRED);
        handler.await.unwrap();

        assert!(timeout(Duration::from_millis(100), listener.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_valid_credential_is_let_through() {
        let (listener, addr) = origin().await;
        let (mut client, server_side) = duplex(4096);
        let _handler = tokio::spawn(
            Connection::new(server_side, "test", context(Credential::from_user_pass("user:pass"))).serve(),
        );

        client
            .write_all(
                format!("CONNECT {} HTTP/1.1\r\nProxy-Authorization: basic dXNlcjpwYXNz\r\n\r\n", addr).as_bytes(),
            )
            .await
            .unwrap();
        let _upstream = listener.accept().await.unwrap();

        let mut reply = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, CONNECTION_ESTABLISHED);
    }

    #[tokio::test]
    async fn test_malformed_request_is_dropped_silently() {
        let (mut client, server_side) = duplex(4096);
        let handler = tokio::spawn(Connection::new(server_side, "test", context(Credential::none())).serve());

        client.write_all(b"GET\r\n").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_is_dropped_silently() {
        let (listener, addr) = origin().await;
        drop(listener);

        let (mut client, server_side) = duplex(4096);
        let handler = tokio::spawn(Connection::new(server_side, "test", context(Credential::none())).serve());

        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", addr).as_bytes())
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
        handler.await.unwrap();
    }
}
