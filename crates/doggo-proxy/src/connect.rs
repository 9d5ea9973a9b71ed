//! Direct relay handlers.
//!
//! Used when no upstream is selected. Handles:
//! - `CONNECT host:port` by opening a TCP connection to the target,
//!   answering `200 Connection Established`, and relaying bytes (the
//!   proxy never terminates TLS).
//! - Absolute-form requests (`GET http://host/path HTTP/1.1`) by rewriting
//!   the request line to origin-form, stripping `Proxy-*` headers, and
//!   forcing `Connection: close` so one client connection maps to one
//!   origin request.

use crate::audit::{self, RelayMode};
use crate::error::{ProxyError, Result};
use crate::http::{self, RequestHead};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Headers never forwarded to an origin server.
const ORIGIN_DROP_HEADERS: &[&str] = &[
    "proxy-authorization",
    "proxy-connection",
    "proxy-authenticate",
    "connection",
    "keep-alive",
];

/// Handle a CONNECT request by tunnelling straight to the target.
///
/// `early` holds bytes the client sent right behind the CONNECT head
/// (e.g. a pipelined TLS ClientHello); they go to the origin first.
pub async fn handle_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    early: &[u8],
    verbose: bool,
) -> Result<()> {
    let target = format!("{}:{}", host, port);
    debug!("Direct CONNECT to {}", target);

    let mut origin = match http::connect_with_timeout(host, port).await {
        Ok(origin) => origin,
        Err(e) => {
            audit::log_failed(verbose, RelayMode::Direct, &target, &e.to_string());
            http::send_response(stream, 502, "Bad Gateway").await?;
            return Err(e);
        }
    };

    http::send_response(stream, 200, "Connection Established").await?;
    if !early.is_empty() {
        origin.write_all(early).await?;
    }
    audit::log_relayed(verbose, RelayMode::Direct, "CONNECT", &target, None);

    let result = tokio::io::copy_bidirectional(stream, &mut origin).await;
    debug!("Direct tunnel closed for {}: {:?}", target, result);

    Ok(())
}

/// Handle an absolute-form request by forwarding it to the origin.
pub async fn handle_forward(stream: &mut TcpStream, head: &RequestHead, verbose: bool) -> Result<()> {
    let (method, target, version) = http::parse_request_line(&head.request_line)?;
    let (host, port, origin_form) = match parse_absolute_target(target) {
        Ok(parts) => parts,
        Err(e) => {
            http::send_response(stream, 400, "Bad Request").await?;
            return Err(e);
        }
    };
    let target_label = format!("{}:{}", host, port);

    let mut origin = match http::connect_with_timeout(&host, port).await {
        Ok(origin) => origin,
        Err(e) => {
            audit::log_failed(verbose, RelayMode::Direct, &target_label, &e.to_string());
            http::send_response(stream, 502, "Bad Gateway").await?;
            return Err(e);
        }
    };

    let mut request = format!("{} {} {}\r\n", method, origin_form, version);
    if !http::has_header(&head.headers, "host") {
        request.push_str(&format!("Host: {}\r\n", host_header(&host, port)));
    }
    request.push_str(&http::filter_headers(&head.headers, ORIGIN_DROP_HEADERS));
    request.push_str("Connection: close\r\n\r\n");

    origin.write_all(request.as_bytes()).await?;
    if !head.buffered.is_empty() {
        origin.write_all(&head.buffered).await?;
    }
    origin.flush().await?;
    audit::log_relayed(verbose, RelayMode::Direct, method, &target_label, None);

    let result = tokio::io::copy_bidirectional(stream, &mut origin).await;
    debug!("Direct forward closed for {}: {:?}", target_label, result);

    Ok(())
}

/// Split an absolute `http://` URI into (host, port, origin-form).
///
/// Only plain `http` is forwarded this way; HTTPS clients use CONNECT.
fn parse_absolute_target(target: &str) -> Result<(String, u16, String)> {
    let parsed = url::Url::parse(target)
        .map_err(|e| ProxyError::HttpParse(format!("invalid request target '{}': {}", target, e)))?;

    if parsed.scheme() != "http" {
        return Err(ProxyError::HttpParse(format!(
            "unsupported scheme in request target: {}",
            target
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ProxyError::HttpParse(format!("missing host in request target: {}", target)))?
        .to_string();
    let port = parsed.port().unwrap_or(80);

    let mut origin_form = parsed.path().to_string();
    if origin_form.is_empty() {
        origin_form.push('/');
    }
    if let Some(query) = parsed.query() {
        origin_form.push('?');
        origin_form.push_str(query);
    }

    Ok((host, port, origin_form))
}

fn host_header(host: &str, port: u16) -> String {
    if port == 80 {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}
