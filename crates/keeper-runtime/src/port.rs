//! TCP port probes.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::DEFAULT_HOST;

/// Socket addresses `host:port` resolves to, falling back to loopback.
fn bind_addrs(host: &str, port: u16) -> Vec<SocketAddr> {
    let host = host.trim_matches(|c| c == '[' || c == ']');
    match (host, port).to_socket_addrs() {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            if !addrs.is_empty() {
                return addrs;
            }
        }
        Err(e) => debug!("Could not resolve {}: {}", host, e),
    }
    (DEFAULT_HOST, port)
        .to_socket_addrs()
        .map(|addrs| addrs.collect())
        .unwrap_or_default()
}

/// Check whether `port` is free on every address `host` resolves to.
///
/// Addresses the machine cannot bind at all (an IPv6 entry for `localhost`
/// with IPv6 disabled) are ignored, but at least one bind must succeed. The
/// listeners are released immediately.
pub fn is_port_available(host: &str, port: u16) -> bool {
    let mut bound = false;
    for addr in bind_addrs(host, port) {
        match TcpListener::bind(addr) {
            Ok(_) => bound = true,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => return false,
            Err(e) => debug!("Cannot bind {}: {}", addr, e),
        }
    }
    bound
}

/// Check whether something accepts TCP connections at `host:port`.
pub async fn is_port_reachable(host: &str, port: u16, connect_timeout: Duration) -> bool {
    matches!(
        timeout(connect_timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Poll until `port` can be bound on `host` or `limit` elapses.
pub async fn wait_for_port_release(host: &str, port: u16, limit: Duration) -> bool {
    let start = Instant::now();
    let interval = Duration::from_millis(200);

    loop {
        if is_port_available(host, port) {
            return true;
        }
        if start.elapsed() >= limit {
            return false;
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_available_port_is_not_reachable() {
        let port = {
            let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
            listener.local_addr().unwrap().port()
        };

        if is_port_available("127.0.0.1", port) {
            assert!(!is_port_reachable("127.0.0.1", port, Duration::from_millis(300)).await);
        }
    }

    #[tokio::test]
    async fn test_bound_port_is_reachable_and_unavailable() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_port_available("127.0.0.1", port));
        assert!(is_port_reachable("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_wait_for_port_release() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!wait_for_port_release("127.0.0.1", port, Duration::from_millis(300)).await);

        drop(listener);
        assert!(wait_for_port_release("127.0.0.1", port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_ipv6_listener_makes_port_unavailable() {
        // Hosts without an IPv6 loopback cannot exercise this.
        let Ok(listener) = TcpListener::bind(("::1", 0)) else {
            return;
        };
        let port = listener.local_addr().unwrap().port();

        assert!(is_port_reachable("::1", port, Duration::from_secs(1)).await);
        assert!(!is_port_available("::1", port));
        assert!(!is_port_available("[::1]", port));
        assert!(!wait_for_port_release("::1", port, Duration::from_millis(300)).await);
    }

    #[test]
    fn test_unresolvable_host_falls_back_to_loopback() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available("no-such-host.invalid", port));
    }

    #[test]
    fn test_localhost_checks_the_ipv4_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available("localhost", port));
        drop(listener);
        assert!(is_port_available("localhost", port));
    }
}
