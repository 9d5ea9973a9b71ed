//! Minimal HTTP/1.x helpers for the forwarding engine.
//!
//! The engine only parses what it needs to pick a destination: the request
//! line, the header block, and the status line of an upstream CONNECT
//! reply. Everything after the head is relayed as opaque bytes.

use crate::error::{ProxyError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Maximum total size of HTTP headers (64 KiB). Prevents OOM from
/// malicious clients sending unbounded header data.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Timeout for outbound TCP connect (origin or upstream proxy).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The parsed head of a client request.
#[derive(Debug)]
pub struct RequestHead {
    /// Request line without the trailing CRLF.
    pub request_line: String,
    /// Raw header lines (CRLF-terminated), without the blank separator.
    pub headers: Vec<u8>,
    /// Bytes read past the header block (start of a request body).
    pub buffered: Vec<u8>,
}

/// Outcome of reading a request head.
#[derive(Debug)]
pub enum ReadHead {
    /// A complete head was read.
    Head(RequestHead),
    /// The client closed before sending anything.
    Closed,
    /// The request line plus headers exceeded [`MAX_HEADER_SIZE`].
    TooLarge,
}

/// Read the request line and headers from a client stream.
///
/// The request line and the header block together may not exceed
/// [`MAX_HEADER_SIZE`]; the reader is capped so an endless line never
/// buffers more than that. The `BufReader` may read ahead into the body;
/// those bytes are returned in `buffered` so nothing is lost when the
/// stream is handed to a relay.
pub async fn read_request_head<S>(stream: &mut S) -> Result<ReadHead>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream).take(MAX_HEADER_SIZE as u64);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    if request_line.is_empty() {
        return Ok(ReadHead::Closed);
    }
    if !request_line.ends_with('\n') && reader.limit() == 0 {
        return Ok(ReadHead::TooLarge);
    }

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if !line.ends_with('\n') && reader.limit() == 0 {
            return Ok(ReadHead::TooLarge);
        }
        if n == 0 || line.trim().is_empty() {
            break;
        }
        headers.extend_from_slice(line.as_bytes());
    }

    Ok(ReadHead::Head(RequestHead {
        request_line: request_line.trim_end().to_string(),
        headers,
        buffered: reader.get_ref().buffer().to_vec(),
    }))
}

/// Split a request line into (method, target, version).
pub fn parse_request_line(line: &str) -> Result<(&str, &str, &str)> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) if version.starts_with("HTTP/") => {
            Ok((method, target, version))
        }
        _ => Err(ProxyError::HttpParse(format!(
            "malformed request line: {}",
            line
        ))),
    }
}

/// Parse the `host:port` target of a CONNECT request line.
///
/// A missing port defaults to 443. Bracketed IPv6 literals keep their
/// brackets so the result can be handed straight to `TcpStream::connect`.
pub fn parse_connect_target(line: &str) -> Result<(String, u16)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 || parts[0] != "CONNECT" {
        return Err(ProxyError::HttpParse(format!(
            "malformed CONNECT line: {}",
            line
        )));
    }

    let authority = parts[1];
    if authority.starts_with('[') && authority.ends_with(']') {
        return Ok((authority.to_string(), 443));
    }
    if let Some((host, port_str)) = authority.rsplit_once(':') {
        if host.is_empty() {
            return Err(ProxyError::HttpParse(format!(
                "missing host in CONNECT: {}",
                authority
            )));
        }
        let port = port_str.parse::<u16>().map_err(|_| {
            ProxyError::HttpParse(format!("invalid port in CONNECT: {}", authority))
        })?;
        Ok((host.to_string(), port))
    } else {
        Ok((authority.to_string(), 443))
    }
}

/// Parse the status code from an HTTP response line.
pub fn parse_status_code(line: &str) -> Result<u16> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return Err(ProxyError::HttpParse(format!(
            "malformed HTTP response: {}",
            line.trim_end()
        )));
    }
    parts[1].parse::<u16>().map_err(|_| {
        ProxyError::HttpParse(format!(
            "invalid status code in response: {}",
            line.trim_end()
        ))
    })
}

/// Keep header lines whose names are not in `drop` (case-insensitive).
///
/// Returns the kept lines re-joined with CRLF, each line terminated.
pub fn filter_headers(header_bytes: &[u8], drop: &[&str]) -> String {
    let header_str = String::from_utf8_lossy(header_bytes);
    let mut kept = String::with_capacity(header_bytes.len());

    for line in header_str.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let name = line.split_once(':').map(|(n, _)| n.trim()).unwrap_or("");
        if drop.iter().any(|d| d.eq_ignore_ascii_case(name)) {
            continue;
        }
        kept.push_str(line);
        kept.push_str("\r\n");
    }

    kept
}

/// Whether the header block carries a header named `name`.
pub fn has_header(header_bytes: &[u8], name: &str) -> bool {
    String::from_utf8_lossy(header_bytes).lines().any(|line| {
        line.split_once(':')
            .is_some_and(|(n, _)| n.trim().eq_ignore_ascii_case(name))
    })
}

/// Connect to `host:port`, trying every resolved address with a timeout.
pub async fn connect_with_timeout(host: &str, port: u16) -> Result<TcpStream> {
    let addr_str = format!("{}:{}", host, port);
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&addr_str)
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            host: host.to_string(),
            reason: format!("DNS resolution failed: {}", e),
        })?
        .collect();

    let mut last_err = None;
    for addr in &addrs {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e.to_string());
            }
            Err(_) => {
                debug!("Connect to {} timed out", addr);
                last_err = Some("connection timed out".to_string());
            }
        }
    }
    Err(ProxyError::UpstreamConnect {
        host: host.to_string(),
        reason: last_err.unwrap_or_else(|| "no addresses to connect to".to_string()),
    })
}

/// Send a bodiless HTTP response line to the client.
pub async fn send_response(stream: &mut TcpStream, status: u16, reason: &str) -> Result<()> {
    let response = format!("HTTP/1.1 {} {}\r\n\r\n", status, reason);
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_request_head_keeps_early_bytes() {
        let mut input: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nping";
        match read_request_head(&mut input).await.unwrap() {
            ReadHead::Head(head) => {
                assert_eq!(head.request_line, "CONNECT example.com:443 HTTP/1.1");
                assert_eq!(head.headers, b"Host: example.com:443\r\n");
                assert_eq!(head.buffered, b"ping");
            }
            other => panic!("expected head, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_request_head_empty_is_closed() {
        let mut input: &[u8] = b"";
        assert!(matches!(
            read_request_head(&mut input).await.unwrap(),
            ReadHead::Closed
        ));
    }

    #[tokio::test]
    async fn test_endless_request_line_is_too_large() {
        let mut line = b"GET http://example.com/".to_vec();
        line.resize(1_000_000, b'a');
        let mut input: &[u8] = &line;
        assert!(matches!(
            read_request_head(&mut input).await.unwrap(),
            ReadHead::TooLarge
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_block_is_too_large() {
        let mut raw = b"GET http://example.com/ HTTP/1.1\r\n".to_vec();
        while raw.len() <= MAX_HEADER_SIZE {
            raw.extend_from_slice(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        raw.extend_from_slice(b"\r\n");
        let mut input: &[u8] = &raw;
        assert!(matches!(
            read_request_head(&mut input).await.unwrap(),
            ReadHead::TooLarge
        ));
    }

    #[tokio::test]
    async fn test_head_just_under_cap_is_accepted() {
        let mut raw = b"GET http://example.com/ HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.resize(MAX_HEADER_SIZE - 4, b'a');
        raw.extend_from_slice(b"\r\n\r\n");
        assert_eq!(raw.len(), MAX_HEADER_SIZE);
        let mut input: &[u8] = &raw;
        assert!(matches!(
            read_request_head(&mut input).await.unwrap(),
            ReadHead::Head(_)
        ));
    }

    #[test]
    fn test_parse_connect_with_port() {
        let (host, port) = parse_connect_target("CONNECT api.example.com:443 HTTP/1.1").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_connect_without_port() {
        let (host, port) = parse_connect_target("CONNECT example.com HTTP/1.1").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_connect_ipv6() {
        let (host, port) = parse_connect_target("CONNECT [::1]:8443 HTTP/1.1").unwrap();
        assert_eq!(host, "[::1]");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_parse_connect_malformed() {
        assert!(parse_connect_target("GET /").is_err());
        assert!(parse_connect_target("").is_err());
        assert!(parse_connect_target("CONNECT :443 HTTP/1.1").is_err());
        assert!(parse_connect_target("CONNECT host:99999 HTTP/1.1").is_err());
    }

    #[test]
    fn test_parse_request_line() {
        let (method, target, version) =
            parse_request_line("GET http://example.com/a?b=1 HTTP/1.1").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(target, "http://example.com/a?b=1");
        assert_eq!(version, "HTTP/1.1");
        assert!(parse_request_line("GET /").is_err());
        assert!(parse_request_line("GET / SPDY/3").is_err());
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(
            parse_status_code("HTTP/1.1 200 Connection Established\r\n").unwrap(),
            200
        );
        assert_eq!(parse_status_code("HTTP/1.0 407 Proxy Auth\r\n").unwrap(), 407);
        assert!(parse_status_code("garbage").is_err());
        assert!(parse_status_code("SSH-2.0 hello").is_err());
    }

    #[test]
    fn test_filter_headers_drops_case_insensitive() {
        let raw = b"Host: example.com\r\nProxy-Authorization: Basic abc\r\nproxy-connection: keep-alive\r\nAccept: */*\r\n";
        let kept = filter_headers(raw, &["proxy-authorization", "Proxy-Connection"]);
        assert_eq!(kept, "Host: example.com\r\nAccept: */*\r\n");
    }

    #[test]
    fn test_has_header() {
        let raw = b"host: example.com\r\nAccept: */*\r\n";
        assert!(has_header(raw, "Host"));
        assert!(!has_header(raw, "Connection"));
    }
}
