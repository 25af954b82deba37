//! The reverse proxy dispatcher.
//!
//! Routes each incoming request by its exact Host header to the registered
//! Service's port. Requests are otherwise relayed untouched, and WebSocket
//! upgrades become a transparent byte splice between client and backend.

use crate::error::{text_error_response, unknown_host_message, DispatchErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::Registry;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The public-facing proxy server.
pub struct ProxyServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl ProxyServer {
    /// Bind the listening socket. Failure here is fatal to startup, which is
    /// the point: a front door that cannot bind its port must not come up.
    pub async fn bind(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        Self::bind_with_pool_config(bind_addr, registry, shutdown_rx, PoolConfig::default()).await
    }

    pub async fn bind_with_pool_config(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            registry,
            shutdown_rx,
            pool: Arc::new(ConnectionPool::new(pool_config)),
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let pool = Arc::clone(&self.pool);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, registry, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<Registry>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, registry, pool).await }
    });

    // with_upgrades keeps WebSocket handshakes working over HTTP/1.1.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    registry: Arc<Registry>,
    pool: Arc<ConnectionPool>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let Some(host) = host_header(&req) else {
        return Ok(text_error_response(
            DispatchErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    debug!(host = %host, method = %req.method(), uri = %req.uri(), "Incoming request");

    // Routing is by the Host header value verbatim. "App.test" and
    // "app.test:8080" are different keys; what the operator wrote in the
    // map file is what routes.
    let port = registry
        .service_for(&host, false)
        .and_then(|service| service.port());
    let Some(port) = port else {
        warn!(host = %host, "Request for unconfigured domain");
        let mut response = text_error_response(
            DispatchErrorCode::UnknownHost,
            unknown_host_message(&host),
        );
        if is_upgrade_request(&req) {
            // A failed handshake must not leave the connection open for
            // pipelined requests.
            response.headers_mut().insert(
                hyper::header::CONNECTION,
                HeaderValue::from_static("close"),
            );
        }
        return Ok(response);
    };

    if is_upgrade_request(&req) {
        return handle_upgrade(req, host, port).await;
    }

    match pool.send_request(req, port).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(host = %host, port, error = %e, "Failed to forward request");
            Ok(text_error_response(
                DispatchErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
    }
}

fn host_header<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
}

/// Check for a `Connection: upgrade` + `Upgrade:` header pair.
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrades = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    connection_upgrades && req.headers().contains_key(hyper::header::UPGRADE)
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Serialize the client's upgrade request as raw HTTP/1.1 for the backend.
/// Headers are forwarded verbatim, Host included.
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's raw HTTP response head into a status and headers.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Splice bytes between the upgraded client connection and the backend.
async fn forward_bidirectional(client: Upgraded, backend: TcpStream, host: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                host,
                client_to_backend, backend_to_client, "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(host, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Relay a WebSocket (or other HTTP upgrade) handshake to the backend and,
/// on 101, splice the two connections together.
async fn handle_upgrade(
    req: Request<Incoming>,
    host: String,
    port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(host = %host, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req);

    let mut backend_stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(host = %host, port, error = %e, "Failed to connect to backend for upgrade");
            return Ok(text_error_response(
                DispatchErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(host = %host, error = %e, "Failed to send upgrade request to backend");
        return Ok(text_error_response(
            DispatchErrorCode::ConnectionFailed,
            "Failed to send upgrade request to backend",
        ));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(host = %host, "Backend closed connection before answering upgrade");
            return Ok(text_error_response(
                DispatchErrorCode::UpgradeFailed,
                "Backend closed connection",
            ));
        }
        Err(e) => {
            error!(host = %host, error = %e, "Failed to read upgrade response from backend");
            return Ok(text_error_response(
                DispatchErrorCode::UpgradeFailed,
                "Failed to read backend response",
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&response_buf[..n]) else {
        error!(host = %host, "Unparseable upgrade response from backend");
        return Ok(text_error_response(
            DispatchErrorCode::UpgradeFailed,
            "Invalid upgrade response from backend",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(host = %host, status = %status, "Backend declined upgrade");
        // Relay the backend's refusal as-is.
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response with parsed status and headers"));
    }

    info!(host = %host, upgrade_type, "Upgrade accepted, splicing connection");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // hyper manages framing headers itself on a 101.
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with parsed status and headers");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, &host).await;
            }
            Err(e) => {
                error!(host = %host, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    fn request_with_headers(headers: &[(&str, &str)]) -> Request<Empty<Bytes>> {
        let mut builder = Request::builder().uri("/chat?room=1");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Empty::new()).unwrap()
    }

    #[test]
    fn test_host_header_is_verbatim() {
        let req = request_with_headers(&[("Host", "App.Test:8080")]);
        // No lowercasing and no port stripping.
        assert_eq!(host_header(&req).as_deref(), Some("App.Test:8080"));

        let req = request_with_headers(&[]);
        assert_eq!(host_header(&req), None);
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = request_with_headers(&[("Connection", "Upgrade"), ("Upgrade", "websocket")]);
        assert!(is_upgrade_request(&req));

        // Connection can carry multiple tokens.
        let req = request_with_headers(&[
            ("Connection", "keep-alive, Upgrade"),
            ("Upgrade", "websocket"),
        ]);
        assert!(is_upgrade_request(&req));

        let req = request_with_headers(&[("Connection", "keep-alive")]);
        assert!(!is_upgrade_request(&req));

        // Upgrade header without Connection: upgrade is not a handshake.
        let req = request_with_headers(&[("Upgrade", "websocket")]);
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_get_upgrade_type() {
        let req = request_with_headers(&[("Upgrade", "WebSocket")]);
        assert_eq!(get_upgrade_type(&req).as_deref(), Some("websocket"));
    }

    #[test]
    fn test_build_upgrade_request_keeps_host() {
        let req = request_with_headers(&[
            ("Host", "app.test"),
            ("Connection", "Upgrade"),
            ("Upgrade", "websocket"),
        ]);
        let raw = build_upgrade_request(&req);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
        assert!(text.to_lowercase().contains("host: app.test\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response_switching_protocols() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Upgrade" && v == "websocket"));
    }

    #[test]
    fn test_parse_upgrade_response_rejection() {
        let raw = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
        let (status, _) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_upgrade_response_garbage() {
        assert!(parse_upgrade_response(b"not http at all").is_none());
        assert!(parse_upgrade_response(&[0xff, 0xfe, 0x00]).is_none());
    }
}
