//! Upstream proxy relay handlers.
//!
//! Used when an upstream is selected. The authority string produced by
//! the selector (`user:password@host:port`, percent-escaped) is parsed
//! back once per accepted connection into an [`UpstreamAuthority`], which
//! carries a ready-made `Proxy-Authorization` value when credentials exist.
//!
//! - CONNECT requests are chained: the proxy sends its own CONNECT to the
//!   upstream, requires a 200, then tunnels bytes both ways.
//! - Absolute-form requests are forwarded as-is, with the client's
//!   `Proxy-Authorization` replaced by the upstream's.

use crate::audit::{self, RelayMode};
use crate::error::{ProxyError, Result};
use crate::http::{self, RequestHead};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;
use zeroize::Zeroizing;

/// Headers replaced when forwarding to an upstream proxy.
const UPSTREAM_DROP_HEADERS: &[&str] = &["proxy-authorization", "proxy-connection", "connection"];

/// Where to reach the selected upstream, plus its auth header value.
#[derive(Clone)]
pub struct UpstreamAuthority {
    pub host: String,
    pub port: u16,
    proxy_authorization: Option<Zeroizing<String>>,
}

impl UpstreamAuthority {
    /// Parse an authority produced by the selector.
    ///
    /// A missing port defaults to 80. User and password are percent-decoded
    /// before being encoded into a `Basic` credential.
    pub fn parse(authority: &str) -> Result<Self> {
        let parsed = url::Url::parse(&format!("http://{}", authority)).map_err(|e| {
            ProxyError::UpstreamProxy(format!("malformed upstream authority: {}", e))
        })?;

        if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(ProxyError::UpstreamProxy(
                "upstream authority must not contain a path".to_string(),
            ));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ProxyError::UpstreamProxy("upstream authority has no host".to_string()))?
            .to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);

        let proxy_authorization = if parsed.username().is_empty() {
            None
        } else {
            let user = decode_component(parsed.username())?;
            let password = decode_component(parsed.password().unwrap_or(""))?;
            let pair = Zeroizing::new(format!("{}:{}", &*user, &*password));
            Some(Zeroizing::new(format!("Basic {}", STANDARD.encode(pair.as_bytes()))))
        };

        Ok(Self {
            host,
            port,
            proxy_authorization,
        })
    }

    /// `host:port` of the upstream, safe to log.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether requests to this upstream carry `Proxy-Authorization`.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.proxy_authorization.is_some()
    }

    fn authorization_header(&self) -> String {
        match self.proxy_authorization {
            Some(ref value) => format!("Proxy-Authorization: {}\r\n", &**value),
            None => String::new(),
        }
    }
}

impl fmt::Debug for UpstreamAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamAuthority")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.has_credentials())
            .finish()
    }
}

fn decode_component(raw: &str) -> Result<Zeroizing<String>> {
    urlencoding::decode(raw)
        .map(|s| Zeroizing::new(s.into_owned()))
        .map_err(|_| ProxyError::UpstreamProxy("upstream credentials are not valid UTF-8".to_string()))
}

/// Handle a CONNECT request by chaining it through the upstream.
///
/// 1. Connect to the upstream proxy
/// 2. Send CONNECT (with optional Proxy-Authorization)
/// 3. Wait for the upstream's 200
/// 4. Answer 200 to the client
/// 5. Replay `early` client bytes that arrived with the CONNECT head
/// 6. Bidirectional tunnel: client <-> upstream <-> target
pub async fn handle_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    early: &[u8],
    upstream: &UpstreamAuthority,
    verbose: bool,
) -> Result<()> {
    let target = format!("{}:{}", host, port);
    let via = upstream.address();
    debug!("Upstream CONNECT to {} via {}", target, via);

    let mut proxy_stream = connect_upstream(stream, upstream, &target, verbose).await?;

    let connect_req = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n{}\r\n",
        target,
        target,
        upstream.authorization_header()
    );
    proxy_stream
        .write_all(connect_req.as_bytes())
        .await
        .map_err(|e| {
            ProxyError::UpstreamProxy(format!("failed to send CONNECT to {}: {}", via, e))
        })?;

    let mut buf_reader = BufReader::new(&mut proxy_stream);
    let mut response_line = String::new();
    buf_reader
        .read_line(&mut response_line)
        .await
        .map_err(|e| {
            ProxyError::UpstreamProxy(format!("failed to read response from {}: {}", via, e))
        })?;

    let status = match http::parse_status_code(&response_line) {
        Ok(status) => status,
        Err(e) => {
            audit::log_failed(verbose, RelayMode::Upstream, &target, &e.to_string());
            http::send_response(stream, 502, "Bad Gateway").await?;
            return Err(e);
        }
    };

    // Drain remaining response headers
    loop {
        let mut line = String::new();
        let n = buf_reader.read_line(&mut line).await.map_err(|e| {
            ProxyError::UpstreamProxy(format!("failed to drain response headers: {}", e))
        })?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
    }

    if status != 200 {
        let reason = format!("upstream rejected CONNECT with status {}", status);
        audit::log_failed(verbose, RelayMode::Upstream, &target, &reason);
        http::send_response(stream, status, "Rejected by upstream proxy").await?;
        return Err(ProxyError::UpstreamProxy(format!(
            "{} rejected CONNECT to {} with status {}",
            via, target, status
        )));
    }

    // Anything the upstream sent after its headers belongs to the tunnel.
    let from_upstream = buf_reader.buffer().to_vec();
    let proxy_stream = buf_reader.into_inner();

    http::send_response(stream, 200, "Connection Established").await?;
    if !from_upstream.is_empty() {
        stream.write_all(&from_upstream).await?;
    }
    if !early.is_empty() {
        proxy_stream.write_all(early).await?;
    }
    audit::log_relayed(verbose, RelayMode::Upstream, "CONNECT", &target, Some(&via));

    let result = tokio::io::copy_bidirectional(stream, proxy_stream).await;
    debug!("Upstream tunnel closed for {} via {}: {:?}", target, via, result);

    Ok(())
}

/// Handle an absolute-form request by forwarding it through the upstream.
pub async fn handle_forward(
    stream: &mut TcpStream,
    head: &RequestHead,
    upstream: &UpstreamAuthority,
    verbose: bool,
) -> Result<()> {
    let (method, target, _) = http::parse_request_line(&head.request_line)?;
    let via = upstream.address();

    let mut proxy_stream = connect_upstream(stream, upstream, target, verbose).await?;

    let mut request = format!("{}\r\n", head.request_line);
    request.push_str(&http::filter_headers(&head.headers, UPSTREAM_DROP_HEADERS));
    request.push_str(&upstream.authorization_header());
    request.push_str("Connection: close\r\n\r\n");

    proxy_stream.write_all(request.as_bytes()).await?;
    if !head.buffered.is_empty() {
        proxy_stream.write_all(&head.buffered).await?;
    }
    proxy_stream.flush().await?;
    audit::log_relayed(verbose, RelayMode::Upstream, method, target, Some(&via));

    let result = tokio::io::copy_bidirectional(stream, &mut proxy_stream).await;
    debug!("Upstream forward closed for {} via {}: {:?}", target, via, result);

    Ok(())
}

async fn connect_upstream(
    stream: &mut TcpStream,
    upstream: &UpstreamAuthority,
    target: &str,
    verbose: bool,
) -> Result<TcpStream> {
    match http::connect_with_timeout(&upstream.host, upstream.port).await {
        Ok(proxy_stream) => Ok(proxy_stream),
        Err(e) => {
            audit::log_failed(verbose, RelayMode::Upstream, target, &e.to_string());
            http::send_response(stream, 502, "Bad Gateway").await?;
            Err(ProxyError::UpstreamProxy(format!(
                "cannot connect to upstream proxy {}: {}",
                upstream.address(),
                e
            )))
        }
    }
}
