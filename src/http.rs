//! HTTP/1.x message heads as seen by a forward proxy.
//!
//! Heads keep the header order and spelling they arrived with so that a
//! forwarded request differs from the original only where the bridge edits
//! it. Bodies are never buffered: [`copy_body`] relays them byte-for-byte
//! while following their framing.
//!
//! Head bytes are decoded as Latin-1, so obs-text (0x80-0xFF) in field
//! values survives the round trip unchanged.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BridgeError;

/// Upper bound on a request or response head (request line plus headers).
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Upper bound on a single chunk-size or trailer line.
const MAX_CHUNK_LINE_BYTES: usize = 4096;

pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
pub const PROXY_AGENT: &str = concat!("proxy-bridge/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn count(&self, name: &str) -> usize {
        self.0.iter().filter(|h| h.name.eq_ignore_ascii_case(name)).count()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    /// True if any comma-separated token of any `name` header equals `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.0
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .flat_map(|h| h.value.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    fn write_to(&self, out: &mut String) {
        for h in &self.0 {
            out.push_str(&h.name);
            out.push_str(": ");
            out.push_str(&h.value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Rewrite an origin-form target (`/path`) into absolute form using the
    /// `Host` header. Absolute and authority-form targets are left alone.
    pub fn make_target_absolute(&mut self) -> Result<(), BridgeError> {
        if !self.target.starts_with('/') {
            return Ok(());
        }
        let host = self
            .headers
            .get("Host")
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                BridgeError::ClientProtocol(format!(
                    "origin-form target {} without a Host header",
                    self.target
                ))
            })?;
        self.target = format!("http://{}{}", host, self.target);
        Ok(())
    }

    /// Whether the client asked for the connection to stay open.
    pub fn wants_keep_alive(&self) -> bool {
        keep_alive(&self.version, &self.headers)
    }

    /// Framing of the request body that follows this head.
    pub fn body_length(&self) -> Result<BodyLength, BridgeError> {
        if self.headers.has_token("Transfer-Encoding", "chunked") {
            return Ok(BodyLength::Chunked);
        }
        match content_length(&self.headers).map_err(BridgeError::ClientProtocol)? {
            Some(0) | None => Ok(BodyLength::Empty),
            Some(n) => Ok(BodyLength::Fixed(n)),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        self.headers.write_to(&mut out);
        latin1_encode(&out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    /// Framing of the response body, given the request it answers.
    pub fn body_length(&self, request: &RequestHead) -> Result<BodyLength, BridgeError> {
        if request.method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyLength::Empty);
        }
        if self.headers.has_token("Transfer-Encoding", "chunked") {
            return Ok(BodyLength::Chunked);
        }
        match content_length(&self.headers).map_err(BridgeError::UpstreamProtocol)? {
            Some(0) => Ok(BodyLength::Empty),
            Some(n) => Ok(BodyLength::Fixed(n)),
            None => Ok(BodyLength::UntilClose),
        }
    }

    pub fn keeps_alive(&self) -> bool {
        keep_alive(&self.version, &self.headers)
    }

    /// A minimal head generated by the bridge itself.
    pub fn synthetic(status: u16, reason: &str) -> Self {
        let mut headers = Headers::default();
        headers.push("Content-Length", "0");
        headers.push("Connection", "close");
        headers.push("Proxy-Agent", PROXY_AGENT);
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason.to_string(),
            headers,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = if self.reason.is_empty() {
            format!("{} {}\r\n", self.version, self.status)
        } else {
            format!("{} {} {}\r\n", self.version, self.status, self.reason)
        };
        self.headers.write_to(&mut out);
        latin1_encode(&out)
    }
}

/// How the end of a message body is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

fn keep_alive(version: &str, headers: &Headers) -> bool {
    if headers.has_token("Connection", "close") {
        return false;
    }
    if version.eq_ignore_ascii_case("HTTP/1.0") {
        return headers.has_token("Connection", "keep-alive");
    }
    true
}

fn content_length(headers: &Headers) -> Result<Option<u64>, String> {
    let mut found: Option<u64> = None;
    for h in headers.iter().filter(|h| h.name.eq_ignore_ascii_case("Content-Length")) {
        let n = h
            .value
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid Content-Length `{}`", h.value))?;
        if found.is_some_and(|prev| prev != n) {
            return Err("conflicting Content-Length headers".to_string());
        }
        found = Some(n);
    }
    Ok(found)
}

/// Read raw head lines up to and including the blank line.
///
/// Returns `Ok(None)` on EOF before the first byte. EOF in the middle of a
/// head, or a head larger than [`MAX_HEAD_BYTES`], is an error.
async fn read_head_lines<R>(reader: &mut R) -> Result<Option<Vec<String>>, String>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut total = 0usize;
    loop {
        let mut line = Vec::new();
        let remaining = (MAX_HEAD_BYTES - total) as u64;
        let n = (&mut *reader)
            .take(remaining)
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| e.to_string())?;
        if n == 0 {
            if total == 0 {
                return Ok(None);
            }
            return Err(if total >= MAX_HEAD_BYTES {
                format!("head exceeds {} bytes", MAX_HEAD_BYTES)
            } else {
                "connection closed mid-head".to_string()
            });
        }
        total += n;
        if !line.ends_with(b"\n") {
            return Err(if total >= MAX_HEAD_BYTES {
                format!("head exceeds {} bytes", MAX_HEAD_BYTES)
            } else {
                "connection closed mid-head".to_string()
            });
        }
        let text = latin1_decode(&line);
        let text = text.trim_end_matches(&['\r', '\n'][..]).to_string();
        // Tolerate stray blank lines before a request line (RFC 9112 2.2)
        if text.is_empty() && lines.is_empty() {
            continue;
        }
        if text.is_empty() {
            return Ok(Some(lines));
        }
        lines.push(text);
    }
}

fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Inverse of [`latin1_decode`]. Characters outside Latin-1 can only come
/// from hooks and are written as `?`.
fn latin1_encode(text: &str) -> Vec<u8> {
    text.chars().map(|c| u8::try_from(c).unwrap_or(b'?')).collect()
}

fn parse_headers(lines: &[String]) -> Result<Headers, String> {
    let mut headers = Headers::default();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err("obsolete header line folding".to_string());
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("header line without colon: `{}`", line))?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(format!("invalid header name `{}`", name));
        }
        // OWS is only space and tab; Latin-1 0x85 and 0xA0 are field content
        headers.push(name, value.trim_matches(|c| c == ' ' || c == '\t'));
    }
    Ok(headers)
}

/// Read a request head from the client side of a session.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>, BridgeError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(lines) = read_head_lines(reader).await.map_err(BridgeError::ClientProtocol)? else {
        return Ok(None);
    };
    let mut parts = lines[0].split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(BridgeError::ClientProtocol(format!(
            "malformed request line `{}`",
            lines[0]
        )));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(BridgeError::ClientProtocol(format!(
            "unsupported protocol version `{}`",
            version
        )));
    }
    if !method.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-' || b == b'_') {
        return Err(BridgeError::ClientProtocol(format!("invalid method `{}`", method)));
    }
    let headers = parse_headers(&lines[1..]).map_err(BridgeError::ClientProtocol)?;
    Ok(Some(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    }))
}

/// Read a response head from the upstream side of a session.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead, BridgeError>
where
    R: AsyncBufRead + Unpin,
{
    let lines = read_head_lines(reader)
        .await
        .map_err(BridgeError::UpstreamProtocol)?
        .ok_or_else(|| {
            BridgeError::UpstreamProtocol("connection closed before a response".to_string())
        })?;
    let status_line = &lines[0];
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..1000).contains(s));
    let (true, Some(status)) = (version.starts_with("HTTP/1."), status) else {
        return Err(BridgeError::UpstreamProtocol(format!(
            "malformed status line `{}`",
            status_line
        )));
    };
    let reason = parts.next().unwrap_or_default().to_string();
    let headers = parse_headers(&lines[1..]).map_err(BridgeError::UpstreamProtocol)?;
    Ok(ResponseHead {
        version: version.to_string(),
        status,
        reason,
        headers,
    })
}

/// Relay one message body from `reader` to `writer`, verbatim, following
/// `length`. Returns the number of bytes written.
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, length: BodyLength) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match length {
        BodyLength::Empty => 0,
        BodyLength::Fixed(n) => copy_exact(reader, writer, n).await?,
        BodyLength::Chunked => copy_chunked(reader, writer).await?,
        BodyLength::UntilClose => tokio::io::copy_buf(reader, writer).await?,
    };
    writer.flush().await?;
    Ok(copied)
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, n: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *reader).take(n), writer).await?;
    if copied < n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("body ended after {} of {} bytes", copied, n),
        ));
    }
    Ok(copied)
}

async fn copy_line<R, W>(reader: &mut R, writer: &mut W) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    (&mut *reader)
        .take(MAX_CHUNK_LINE_BYTES as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if !line.ends_with(b"\n") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated or oversized chunk line",
        ));
    }
    writer.write_all(&line).await?;
    Ok(line)
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let line = copy_line(reader, writer).await?;
        total += line.len() as u64;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            // trailer section ends with an empty line
            loop {
                let trailer = copy_line(reader, writer).await?;
                total += trailer.len() as u64;
                if trailer == b"\r\n" || trailer == b"\n" {
                    return Ok(total);
                }
            }
        }
        total += copy_exact(reader, writer, size).await?;
        let crlf = copy_line(reader, writer).await?;
        total += crlf.len() as u64;
        if crlf != b"\r\n" && crlf != b"\n" {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "missing CRLF after chunk data"));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size is not UTF-8"))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("bad chunk size `{}`", digits)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn request(raw: &str) -> Result<Option<RequestHead>, BridgeError> {
        let mut reader = BufReader::new(raw.as_bytes());
        read_request_head(&mut reader).await
    }

    #[tokio::test]
    async fn test_parse_connect_request() {
        let head = request("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nUser-Agent: curl/8\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(head.is_connect());
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.headers.get("host"), Some("example.com:443"));
        assert_eq!(
            head.to_bytes(),
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nUser-Agent: curl/8\r\n\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_eof_before_request_is_not_an_error() {
        assert!(request("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        for raw in [
            "GARBAGE\r\n\r\n",
            "GET / HTTP/1.1 extra\r\n\r\n",
            "GET / SPDY/3\r\n\r\n",
            "GET / HTTP/1.1\r\nNoColonHere\r\n\r\n",
            "GET / HTTP/1.1\r\nHost: a\r\n",
        ] {
            let err = request(raw).await.unwrap_err();
            assert!(matches!(err, BridgeError::ClientProtocol(_)), "{raw:?} gave {err:?}");
        }
    }

    #[tokio::test]
    async fn test_oversized_head_is_rejected() {
        let raw = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(MAX_HEAD_BYTES));
        let err = request(&raw).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_origin_form_target_becomes_absolute() {
        let mut headers = Headers::default();
        headers.push("Host", "example.com:8080");
        let mut head = RequestHead {
            method: "GET".to_string(),
            target: "/index.html?q=1".to_string(),
            version: "HTTP/1.1".to_string(),
            headers,
        };
        head.make_target_absolute().unwrap();
        assert_eq!(head.target, "http://example.com:8080/index.html?q=1");

        // already absolute: untouched
        head.make_target_absolute().unwrap();
        assert_eq!(head.target, "http://example.com:8080/index.html?q=1");
    }

    #[test]
    fn test_origin_form_without_host_fails() {
        let mut head = RequestHead {
            method: "GET".to_string(),
            target: "/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::default(),
        };
        assert!(matches!(
            head.make_target_absolute(),
            Err(BridgeError::ClientProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_parse_response_head() {
        let mut reader = BufReader::new(&b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n"[..]);
        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, 407);
        assert_eq!(head.reason, "Proxy Authentication Required");
        assert!(!head.is_success());

        let mut reader = BufReader::new(&b"HTTP/1.0 200\r\n\r\n"[..]);
        let head = read_response_head(&mut reader).await.unwrap();
        assert!(head.is_success());
        assert_eq!(head.to_bytes(), b"HTTP/1.0 200\r\n\r\n".to_vec());

        let mut reader = BufReader::new(&b"SSH-2.0-OpenSSH\r\n\r\n"[..]);
        assert!(matches!(
            read_response_head(&mut reader).await,
            Err(BridgeError::UpstreamProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_obs_text_header_round_trips() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Disposition: attachment; filename=\"caf\xe9 \xa0.txt\"\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(
            head.headers.get("content-disposition"),
            Some("attachment; filename=\"caf\u{e9} \u{a0}.txt\"")
        );
        assert_eq!(head.to_bytes(), raw.to_vec());

        let raw = b"GET http://origin.test/ HTTP/1.1\r\nX-Name: Andr\xe9\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.to_bytes(), raw.to_vec());
    }

    #[test]
    fn test_keep_alive_defaults() {
        let mut headers = Headers::default();
        assert!(keep_alive("HTTP/1.1", &headers));
        assert!(!keep_alive("HTTP/1.0", &headers));
        headers.push("Connection", "Keep-Alive");
        assert!(keep_alive("HTTP/1.0", &headers));
        headers.push("connection", "close");
        assert!(!keep_alive("HTTP/1.1", &headers));
    }

    #[test]
    fn test_response_body_length() {
        let get = RequestHead {
            method: "GET".to_string(),
            target: "http://a/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::default(),
        };
        let head_req = RequestHead {
            method: "HEAD".to_string(),
            ..get.clone()
        };
        let mut headers = Headers::default();
        headers.push("Content-Length", "12");
        let resp = ResponseHead {
            version: "HTTP/1.1".to_string(),
            status: 200,
            reason: "OK".to_string(),
            headers,
        };
        assert_eq!(resp.body_length(&get).unwrap(), BodyLength::Fixed(12));
        assert_eq!(resp.body_length(&head_req).unwrap(), BodyLength::Empty);

        let bare = ResponseHead {
            headers: Headers::default(),
            ..resp.clone()
        };
        assert_eq!(bare.body_length(&get).unwrap(), BodyLength::UntilClose);

        let mut conflicting = Headers::default();
        conflicting.push("Content-Length", "1");
        conflicting.push("Content-Length", "2");
        let bad = ResponseHead {
            headers: conflicting,
            ..resp
        };
        assert!(bad.body_length(&get).is_err());
    }

    #[tokio::test]
    async fn test_chunked_body_is_relayed_verbatim() {
        let wire = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\nNEXT".to_vec();
        let mut reader = BufReader::new(&wire[..]);
        let mut out = Vec::new();
        let copied = copy_body(&mut reader, &mut out, BodyLength::Chunked).await.unwrap();
        let expected = &wire[..wire.len() - 4];
        assert_eq!(out, expected);
        assert_eq!(copied, expected.len() as u64);

        // the next message is left untouched in the reader
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"NEXT");
    }

    #[tokio::test]
    async fn test_fixed_body_short_read_fails() {
        let mut reader = BufReader::new(&b"abc"[..]);
        let mut out = Vec::new();
        let err = copy_body(&mut reader, &mut out, BodyLength::Fixed(10)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
