//! Local TLS-terminating reverse proxy in front of the user's service.
//!
//! Binds an ephemeral loopback port; the remote acceptor dials it for every
//! public connection. TLS is terminated here with the certificate provider's
//! material, `acme-tls/1` validation handshakes are answered in place, and
//! plain requests are forwarded as-is to the configured upstream.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{header, HeaderMap, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use loophole_cert::{CertificateProvider, ACME_TLS_ALPN_NAME};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

/// Reverse proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream connection failed: {0}")]
    UpstreamConnect(std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Certificate error: {0}")]
    Cert(#[from] loophole_cert::CertError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Bind the loopback TLS listener and start serving on a background task.
///
/// Returns the kernel-assigned proxied endpoint. The upstream is
/// `http://<upstream>`, forwarded to verbatim.
pub async fn start(
    upstream: String,
    provider: Arc<CertificateProvider>,
) -> Result<SocketAddr, ProxyError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;

    debug!("Local TLS proxy listening on {} for {}", addr, upstream);
    tokio::spawn(run(listener, upstream, provider));

    Ok(addr)
}

async fn run(listener: TcpListener, upstream: String, provider: Arc<CertificateProvider>) {
    loop {
        match listener.accept().await {
            Ok((tcp, peer)) => {
                let upstream = upstream.clone();
                let provider = provider.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(tcp, upstream, provider).await {
                        debug!("Proxy connection from {} ended with error: {}", peer, err);
                    }
                });
            }
            Err(err) => {
                warn!("Local TLS listener accept failed: {}", err);
            }
        }
    }
}

async fn handle_connection(
    tcp: TcpStream,
    upstream: String,
    provider: Arc<CertificateProvider>,
) -> Result<(), ProxyError> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), tcp);
    let start = acceptor.await?;
    let hello = start.client_hello();

    let is_acme = hello
        .alpn()
        .map(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN_NAME))
        .unwrap_or(false);

    if let Some(sni) = hello.server_name() {
        if !provider.is_whitelisted(sni) {
            debug!("Rejecting TLS connection for non-whitelisted host {}", sni);
            return Ok(());
        }
    }

    if is_acme {
        let Some(config) = provider.challenge_config() else {
            warn!("acme-tls/1 handshake arrived with no active challenge");
            return Ok(());
        };
        // Completing the handshake with the challenge certificate is the
        // whole validation; no application data follows.
        let mut tls = start.into_stream(config).await?;
        let _ = tls.shutdown().await;
        debug!("Answered acme-tls/1 validation handshake");
        return Ok(());
    }

    // First handshake may block here while the certificate is obtained.
    let config = provider.server_config().await?;
    let tls = start.into_stream(config).await?;

    let io = TokioIo::new(tls);
    let service = service_fn(move |req| forward(req, upstream.clone()));
    server_http1::Builder::new().serve_connection(io, service).await?;

    Ok(())
}

/// Forward one request to the upstream over a fresh http1 connection,
/// streaming the body both ways.
async fn forward(
    req: Request<Incoming>,
    upstream: String,
) -> Result<Response<Incoming>, ProxyError> {
    let stream = TcpStream::connect(&upstream)
        .await
        .map_err(ProxyError::UpstreamConnect)?;
    let io = TokioIo::new(stream);

    let (mut sender, conn) = client_http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Upstream connection closed: {}", err);
        }
    });

    let (mut parts, body) = req.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    parts.uri = origin_form(&parts.uri)?;

    let mut response = sender.send_request(Request::from_parts(parts, body)).await?;
    strip_hop_by_hop(response.headers_mut());

    Ok(response)
}

/// Reduce an absolute URI to its origin form for the upstream request line.
fn origin_form(uri: &Uri) -> Result<Uri, ProxyError> {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    path.parse()
        .map_err(|err| ProxyError::InvalidRequest(format!("bad request target: {}", err)))
}

/// Drop hop-by-hop headers: anything named by `Connection` plus the
/// standard set. End-to-end headers pass through untouched.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(',').map(|name| name.trim().to_ascii_lowercase()))
        .filter(|name| !name.is_empty())
        .collect();

    for name in connection_listed {
        headers.remove(name.as_str());
    }

    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_standard_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(header::UPGRADE, "h2c".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        headers.insert("x-custom", "stays".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(headers.get(header::UPGRADE).is_none());
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(headers.get("x-custom").unwrap(), "stays");
    }

    #[test]
    fn strips_headers_named_by_connection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "close, x-session-token".parse().unwrap());
        headers.insert("x-session-token", "secret".parse().unwrap());
        headers.insert("x-other", "stays".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("x-session-token").is_none());
        assert_eq!(headers.get("x-other").unwrap(), "stays");
    }

    #[test]
    fn origin_form_keeps_path_and_query() {
        let uri: Uri = "https://abc123.loophole.site/ping?x=1".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap().to_string(), "/ping?x=1");

        let uri: Uri = "/already/origin".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap().to_string(), "/already/origin");
    }
}
