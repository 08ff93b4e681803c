//! Serve entrypoint shared by the `serve` and `launch` commands.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::{engine::Completer, error::Result};

use super::handlers::router;

/// Handle returned by [`serve`]: the bound port and a shutdown trigger.
pub struct ServeHandle {
    /// The port the server is listening on.
    pub port: u16,
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: Option<tokio::task::JoinHandle<std::io::Result<()>>>,
}

impl ServeHandle {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL for clients on this host
    pub fn local_url(&self) -> String {
        client_url(self.addr)
    }

    /// Trigger graceful shutdown and wait for the server to stop.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            join.await.map_err(std::io::Error::other)??;
        }
        Ok(())
    }
}

/// Bind the chat API and start serving in a spawned task.
pub async fn serve(completer: Arc<dyn Completer>, bind: &str) -> Result<ServeHandle> {
    let app = router(completer);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    let port = addr.port();
    tracing::info!("chat server listening on {addr}");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("received shutdown signal");
            })
            .await
    });

    Ok(ServeHandle {
        port,
        addr,
        shutdown_tx: Some(shutdown_tx),
        join: Some(join),
    })
}

/// URL a local client reaches `addr` at; wildcard binds map to loopback
fn client_url(addr: SocketAddr) -> String {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}", SocketAddr::new(ip, addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::MockCompleter;

    #[test]
    fn test_client_url() {
        let url = |s: &str| client_url(s.parse().unwrap());
        assert_eq!(url("0.0.0.0:8080"), "http://127.0.0.1:8080");
        assert_eq!(url("[::]:8080"), "http://[::1]:8080");
        assert_eq!(url("192.168.1.5:5000"), "http://192.168.1.5:5000");
        assert_eq!(url("[fe80::1]:5000"), "http://[fe80::1]:5000");
    }

    #[tokio::test]
    async fn test_wildcard_bind_is_reachable() {
        let handle = serve(Arc::new(MockCompleter), "0.0.0.0:0").await.unwrap();
        assert!(handle.local_addr().ip().is_unspecified());

        let url = format!("{}/api/chat/healthcheck", handle.local_url());
        let resp = reqwest::get(url).await.unwrap();
        assert_eq!(resp.status(), 200);
        handle.shutdown().await.unwrap();
    }
}
