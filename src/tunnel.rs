use crate::logging::LogSink;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt};

/// Bytes moved in each direction over one tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Client to origin; `None` when the client was still sending as the
    /// tunnel closed.
    pub upstream: Option<u64>,
    /// Origin to client.
    pub downstream: u64,
}

/// Relays opaque bytes between an established client and origin.
///
/// Client to origin is copied on a spawned task that shuts down the origin's
/// write side when the client stops sending. Origin to client is copied on the
/// caller's task, and its end is the end of the tunnel: the spawned task is
/// then aborted and joined, so nothing keeps running once this returns.
///
/// Copy errors on either leg are logged as warnings and otherwise treated as
/// an ordinary end of stream.
pub async fn tunnel<CR, CW, OR, OW>(
    client_reader: CR,
    mut client_writer: CW,
    mut origin_reader: OR,
    origin_writer: OW,
    sink: &LogSink,
) -> TunnelStats
where
    CR: AsyncBufRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin,
    OR: AsyncRead + Unpin,
    OW: AsyncWrite + Unpin + Send + 'static,
{
    let upstream_sink = sink.clone();
    let upstream = tokio::spawn(async move {
        let mut client_reader = client_reader;
        let mut origin_writer = origin_writer;
        let copied = match tokio::io::copy_buf(&mut client_reader, &mut origin_writer).await {
            Ok(n) => n,
            Err(e) => {
                upstream_sink.warn(format_args!("client -> origin: {}", e));
                0
            }
        };
        let _ = origin_writer.shutdown().await;
        copied
    });

    let downstream = match tokio::io::copy(&mut origin_reader, &mut client_writer).await {
        Ok(n) => n,
        Err(e) => {
            sink.warn(format_args!("origin -> client: {}", e));
            0
        }
    };
    let _ = client_writer.flush().await;

    upstream.abort();
    let upstream = upstream.await.ok();

    TunnelStats { upstream, downstream }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader, duplex};

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (mut client, proxy_client) = duplex(1024);
        let (proxy_origin, mut origin) = duplex(1024);
        let (client_reader, client_writer) = tokio::io::split(proxy_client);
        let (origin_reader, origin_writer) = tokio::io::split(proxy_origin);

        let relay = tokio::spawn(async move {
            tunnel(
                BufReader::new(client_reader),
                client_writer,
                origin_reader,
                origin_writer,
                &LogSink::default(),
            )
            .await
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Origin hanging up ends the tunnel.
        drop(origin);
        let stats = relay.await.unwrap();
        assert_eq!(stats, TunnelStats { upstream: None, downstream: 5 });

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_client_eof_shuts_down_origin_write() {
        let (mut client, proxy_client) = duplex(1024);
        let (proxy_origin, mut origin) = duplex(1024);
        let (client_reader, client_writer) = tokio::io::split(proxy_client);
        let (origin_reader, origin_writer) = tokio::io::split(proxy_origin);

        let relay = tokio::spawn(async move {
            tunnel(
                BufReader::new(client_reader),
                client_writer,
                origin_reader,
                origin_writer,
                &LogSink::default(),
            )
            .await
        });

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        origin.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        origin.write_all(b"response").await.unwrap();
        drop(origin);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response");

        let stats = relay.await.unwrap();
        assert_eq!(stats.upstream, Some(7));
        assert_eq!(stats.downstream, 8);
    }
}
