//! Loopback control endpoint.
//!
//! A small HTTP listener on 127.0.0.1 that carries reload notifications
//! ("restart the backend for domain X") and exposes service status. The
//! `reload` CLI subcommand publishes to it from another process.

use crate::registry::Registry;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const DEFAULT_CONTROL_PORT: u16 = 7411;

/// Control port, overridable via `HOSTGATE_CONTROL_PORT`.
pub fn control_port() -> u16 {
    std::env::var("HOSTGATE_CONTROL_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CONTROL_PORT)
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// The control server. Loopback only; it has no authentication and must
/// never be bound to a public interface.
pub struct ControlServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    pub async fn bind(
        port: u16,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "Control server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let registry = Arc::clone(&registry);
                                    async move { handle_control_request(req, registry).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_control_request(
    req: Request<hyper::body::Incoming>,
    registry: Arc<Registry>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Control request");

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/services") => {
            let statuses = registry.statuses();
            let body = serde_json::json!({
                "services": statuses,
                "count": statuses.len(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::POST, path) if path.starts_with("/reload/") => {
            let domain = path.strip_prefix("/reload/").unwrap_or("");
            if domain.is_empty() {
                response(StatusCode::BAD_REQUEST, "missing domain")
            } else {
                match registry.service_for(domain, false) {
                    Some(service) => {
                        info!(domain, "Reload requested, restarting backend");
                        service.restart();
                    }
                    None => {
                        // Notifications for domains this instance does not
                        // serve are dropped, not errors.
                        debug!(domain, "Reload for unknown domain ignored");
                    }
                }
                response(StatusCode::OK, "ok")
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

/// Publish a reload notification for `domain` to a running instance.
pub async fn publish_reload(domain: &str) -> anyhow::Result<()> {
    let url = format!(
        "http://127.0.0.1:{}/reload/{}",
        control_port(),
        domain
    );
    let response = reqwest::Client::new().post(&url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("reload request failed with status {}", response.status());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var mutation is process-global, so all control_port cases live in
    // one test to avoid racing parallel tests.
    #[test]
    fn test_control_port_env_override() {
        std::env::remove_var("HOSTGATE_CONTROL_PORT");
        assert_eq!(control_port(), DEFAULT_CONTROL_PORT);

        std::env::set_var("HOSTGATE_CONTROL_PORT", "9123");
        assert_eq!(control_port(), 9123);

        // Unparseable values fall back to the default.
        std::env::set_var("HOSTGATE_CONTROL_PORT", "not-a-port");
        assert_eq!(control_port(), DEFAULT_CONTROL_PORT);

        std::env::remove_var("HOSTGATE_CONTROL_PORT");
    }
}
