//! Ephemeral port allocation.

use std::net::{IpAddr, Ipv4Addr};
use tokio::net::TcpListener;

/// Ask the operating system for a currently unused TCP port on the given
/// address.
///
/// Binds a transient listener on port 0, reads back the assigned port and
/// releases the socket. Stateless and safe to call concurrently; every call
/// yields an independently OS-chosen port. The port is only reserved while
/// the transient socket is held, so the caller should hand it to the backend
/// promptly.
pub async fn allocate(bind_addr: IpAddr) -> anyhow::Result<u16> {
    let listener = TcpListener::bind((bind_addr, 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Allocate an ephemeral port on the loopback address.
pub async fn allocate_loopback() -> anyhow::Result<u16> {
    allocate(IpAddr::V4(Ipv4Addr::LOCALHOST)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_returns_nonzero_port() {
        let port = allocate_loopback().await.unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_allocate_returns_distinct_ports() {
        let first = allocate_loopback().await.unwrap();
        let second = allocate_loopback().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_allocated_port_is_bindable() {
        let port = allocate_loopback().await.unwrap();
        let listener = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(listener.is_ok());
    }
}
