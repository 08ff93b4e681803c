use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Public DNS resolver used as the reachability probe
pub const PROBE_ADDR: &str = "1.1.1.1:53";

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether a TCP connection to `addr` succeeds within `timeout`
pub async fn reachable(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Check for internet access, used to flag hosts that are not firewalled
/// while running in offline mode.
pub async fn internet_accessible() -> bool {
    match PROBE_ADDR.parse() {
        Ok(addr) => reachable(addr, PROBE_TIMEOUT).await,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_listener_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(reachable(addr, PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!reachable(addr, PROBE_TIMEOUT).await);
    }
}
