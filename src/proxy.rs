//! Host-side TCP proxy.
//!
//! Accepts real connections whose (peer, local) addresses identify a
//! tracked route, dials the route's outbound destination, and copies
//! bytes both ways. Connections without a matching route are closed
//! immediately.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::protocols::Protocol;
use crate::routes::{denormalize_ip, normalize_ip, Controller};
use crate::shutdown::Shutdown;

/// A running TCP proxy listener.
pub struct TcpProxy {
    port: u16,
}

impl TcpProxy {
    /// Bind an ephemeral listener and start accepting.
    pub async fn spawn(routes: Arc<Controller>, shutdown: Shutdown) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        tokio::spawn(accept_loop(listener, routes, shutdown));
        Ok(Self { port })
    }

    /// The local port the proxy listens on.
    pub fn port(&self) -> u16 {
        self.port
    }
}

async fn accept_loop(listener: TcpListener, routes: Arc<Controller>, shutdown: Shutdown) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((conn, peer)) => {
                tokio::spawn(bridge(conn, peer, Arc::clone(&routes), shutdown.clone()));
            }
            Err(err) => {
                warn!("proxy/tcp: accept error: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn bridge(mut conn: TcpStream, peer: SocketAddr, routes: Arc<Controller>, shutdown: Shutdown) {
    let Ok(local) = conn.local_addr() else {
        return;
    };

    let Some(route) = routes.table().lookup(
        Protocol::Tcp,
        normalize_ip(peer.ip()),
        normalize_ip(local.ip()),
        peer.port(),
        local.port(),
    ) else {
        trace!(%peer, "proxy/tcp: no route");
        return;
    };

    let target = SocketAddr::new(
        denormalize_ip(route.outbound.dst.ip),
        route.outbound.dst.port,
    );
    let mut upstream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(%target, "proxy/tcp: dial error: {err}");
            return;
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut conn, &mut upstream) => {
            if let Err(err) = result {
                trace!("proxy/tcp: stream ended: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortAllocator;
    use crate::routes::RouteSpec;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpSocket;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    while let Ok(n) = conn.read(&mut buf).await {
                        if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn bridges_known_routes() {
        let upstream = echo_upstream().await;
        let routes = Arc::new(Controller::new(Arc::new(PortAllocator::new())));
        let shutdown = Shutdown::new();
        let proxy = TcpProxy::spawn(Arc::clone(&routes), shutdown.clone())
            .await
            .unwrap();

        // Bind the client first so its source address can be routed.
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client_addr = socket.local_addr().unwrap();

        routes
            .add_route(
                RouteSpec::new(Protocol::Tcp, "h")
                    .inbound_source(LOCALHOST, client_addr.port())
                    .inbound_destination(LOCALHOST, proxy.port())
                    .outbound_destination(upstream.ip(), upstream.port()),
            )
            .unwrap();

        let mut conn = socket
            .connect(SocketAddr::new(LOCALHOST, proxy.port()))
            .await
            .unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        shutdown.trigger();
    }

    #[tokio::test]
    async fn unknown_routes_are_closed() {
        let routes = Arc::new(Controller::new(Arc::new(PortAllocator::new())));
        let shutdown = Shutdown::new();
        let proxy = TcpProxy::spawn(routes, shutdown.clone()).await.unwrap();

        let mut conn = TcpStream::connect(SocketAddr::new(LOCALHOST, proxy.port()))
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        let n = conn.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "connection should be closed without data");

        shutdown.trigger();
    }
}
