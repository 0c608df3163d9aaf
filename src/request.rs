//! Request-line parsing and tunnel information extraction.
//!
//! A client request is read exactly once, up to the blank line ending its
//! header. Everything the connection handler needs to pick a destination,
//! authenticate the client and forward the request is derived from that read.

use crate::error::ProxyError;
use bytes::{BufMut, Bytes, BytesMut};
use http::uri::{Authority, Uri};
use std::borrow::Cow;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Port assumed when a plain HTTP target names none.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default bound on the request line plus all header lines.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

/// The three parts of an HTTP request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub proto: &'a str,
}

impl<'a> RequestLine<'a> {
    /// Splits `line` at its first two spaces. Returns `None` when the line has
    /// fewer than two spaces. Nothing beyond this split is validated.
    pub fn parse(line: &'a str) -> Option<Self> {
        let (method, rest) = line.split_once(' ')?;
        let (target, proto) = rest.split_once(' ')?;
        Some(Self { method, target, proto })
    }

    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }
}

/// Case-insensitive, multi-valued header map that remembers arrival order.
///
/// Keys are stored in canonical form (`proxy-authorization` becomes
/// `Proxy-Authorization`) and iterate in the order they first appeared; the
/// values of a repeated key stay grouped under it in arrival order. Values are
/// raw bytes, since obs-text (0x80-0xFF) is legal in a header value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeHeader {
    entries: Vec<(String, Vec<Vec<u8>>)>,
}

impl MimeHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &str, value: impl AsRef<[u8]>) {
        let key = canonical_header_key(key);
        let value = value.as_ref().to_vec();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key.into_owned(), vec![value])),
        }
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.get_all(key).first().map(Vec::as_slice)
    }

    /// First value stored under `key`, if it is valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_all(&self, key: &str) -> &[Vec<u8>] {
        let key = canonical_header_key(key);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    /// Every (key, value) pair, one per stored value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v.as_slice())))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn append_to_last(&mut self, continuation: &[u8]) {
        if let Some(last) = self.entries.last_mut().and_then(|(_, values)| values.last_mut()) {
            last.push(b' ');
            last.extend_from_slice(continuation);
        }
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn is_space(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn trim_space(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !is_space(*first) {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !is_space(*last) {
            break;
        }
        bytes = rest;
    }
    bytes
}

/// Canonical MIME form of a header key: first letter and every letter after a
/// hyphen upper-cased, the rest lower-cased. Keys holding non-token bytes are
/// returned unchanged.
pub fn canonical_header_key(key: &str) -> Cow<'_, str> {
    if !key.bytes().all(is_token_byte) {
        return Cow::Borrowed(key);
    }
    let mut upper = true;
    let canonical: String = key
        .chars()
        .map(|c| {
            let mapped = if upper { c.to_ascii_uppercase() } else { c.to_ascii_lowercase() };
            upper = c == '-';
            mapped
        })
        .collect();
    if canonical == key {
        Cow::Borrowed(key)
    } else {
        Cow::Owned(canonical)
    }
}

/// Line-oriented reader over the client stream that enforces the header size
/// limit across every line it hands out.
struct HeaderReader<'a, R> {
    reader: &'a mut R,
    remaining: usize,
    limit: usize,
}

impl<'a, R> HeaderReader<'a, R>
where
    R: AsyncBufRead + Unpin,
{
    fn new(reader: &'a mut R, limit: usize) -> Self {
        Self { reader, remaining: limit, limit }
    }

    /// Reads one line and strips its `\n` or `\r\n` terminator.
    async fn read_line(&mut self) -> Result<Vec<u8>, ProxyError> {
        let mut buf = Vec::new();
        let n = (&mut *self.reader)
            .take(self.remaining as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        self.remaining -= n;

        if buf.last() != Some(&b'\n') {
            if self.remaining == 0 {
                return Err(ProxyError::HeaderTooLarge(self.limit));
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before end of line",
            )
            .into());
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(buf)
    }

    /// Reads header lines up to and including the blank terminator line.
    async fn read_mime_header(&mut self) -> Result<MimeHeader, ProxyError> {
        let mut header = MimeHeader::new();
        let mut first = true;
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(header);
            }

            let malformed =
                || ProxyError::MalformedHeader(format!("line {:?}", String::from_utf8_lossy(&line)));

            if is_space(line[0]) {
                if first {
                    return Err(ProxyError::MalformedHeader(format!(
                        "initial line {:?}",
                        String::from_utf8_lossy(&line)
                    )));
                }
                header.append_to_last(trim_space(&line));
                continue;
            }
            first = false;

            let colon = line.iter().position(|&b| b == b':').ok_or_else(malformed)?;
            let (key, value) = (&line[..colon], &line[colon + 1..]);
            if key.iter().copied().any(is_space) {
                return Err(malformed());
            }
            if key.is_empty() {
                continue;
            }
            let key = std::str::from_utf8(key).map_err(|_| malformed())?;
            header.add(key, trim_space(value));
        }
    }
}

/// What the connection handler needs to know about one client request.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// Request line and headers, re-serialized for forwarding to the origin.
    /// Unused for CONNECT.
    pub raw_header: Bytes,
    /// Destination in `host:port` form.
    pub remote: String,
    /// Raw `Proxy-Authorization` value, empty when the client sent none or
    /// sent bytes that are not UTF-8.
    pub credential: String,
    pub is_https: bool,
}

/// Reads one request (line and headers) from `reader` and derives the
/// destination, credential and forwardable header.
///
/// On success the reader is positioned at the first byte after the header,
/// so any request body is still waiting to be relayed.
pub async fn read_tunnel_info<R>(reader: &mut R, max_header_size: usize) -> Result<TunnelInfo, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = HeaderReader::new(reader, max_header_size);

    let request_line = String::from_utf8(lines.read_line().await?)?;
    let parsed = RequestLine::parse(&request_line)
        .ok_or_else(|| ProxyError::MalformedRequest(request_line.clone()))?;

    let is_https = parsed.is_connect();
    // CONNECT carries a bare authority; prefixing a scheme lets it parse as a URI.
    let target = if is_https {
        Cow::Owned(format!("http://{}", parsed.target))
    } else {
        Cow::Borrowed(parsed.target)
    };
    let target_authority = target_authority(&target)?;

    let header = lines.read_mime_header().await?;
    let credential = header.get_str("Proxy-Authorization").unwrap_or_default().to_string();

    let remote = match target_authority {
        Some(authority) => host_port(&authority),
        None => {
            let host = header
                .get("Host")
                .filter(|h| !h.is_empty())
                .ok_or(ProxyError::MissingHost)?;
            let authority = Authority::try_from(host).map_err(|e| {
                ProxyError::Uri(format!("Host {}: {}", String::from_utf8_lossy(host), e))
            })?;
            host_port(&authority)
        }
    };

    Ok(TunnelInfo {
        raw_header: rebuild_header(&request_line, &header),
        remote,
        credential,
        is_https,
    })
}

/// Authority named by a request target, `None` for origin-form (`/path`).
///
/// `http::Uri` is stricter about path characters than most clients; when it
/// rejects an absolute target, the authority between `scheme://` and the first
/// `/`, `?` or `#` is parsed on its own.
fn target_authority(target: &str) -> Result<Option<Authority>, ProxyError> {
    let err = match target.parse::<Uri>() {
        Ok(uri) => return Ok(uri.into_parts().authority),
        Err(e) => e,
    };
    if target.starts_with('/') {
        return Ok(None);
    }
    let rest = match target.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() => rest,
        _ => return Err(ProxyError::Uri(format!("{}: {}", target, err))),
    };
    let authority = rest.find(['/', '?', '#']).map_or(rest, |end| &rest[..end]);
    authority
        .parse::<Authority>()
        .map(Some)
        .map_err(|e| ProxyError::Uri(format!("{}: {}", target, e)))
}

/// `host:port` for `authority`, defaulting the port to 80. An explicit port is
/// kept exactly as written.
fn host_port(authority: &Authority) -> String {
    match authority.port() {
        Some(port) => format!("{}:{}", authority.host(), port.as_str()),
        None => format!("{}:{}", authority.host(), DEFAULT_HTTP_PORT),
    }
}

/// Request line, one `Key:Value` line per header value, blank line.
pub fn rebuild_header(request_line: &str, header: &MimeHeader) -> Bytes {
    let mut buf = BytesMut::with_capacity(request_line.len() + 64 * header.len() + 4);
    buf.put_slice(request_line.as_bytes());
    buf.put_slice(b"\r\n");
    for (key, value) in header.iter() {
        buf.put_slice(key.as_bytes());
        buf.put_u8(b':');
        buf.put_slice(value);
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}
