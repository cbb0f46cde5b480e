use std::net::SocketAddr;
use std::time::Duration;

use tokio::io;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Raw TCP passthrough from a public port to one fixed instance address.
pub struct Proxy {
    listener: TcpListener,
    target: String,
}

impl Proxy {
    /// Binds the public port. Failing here is fatal for the sidecar.
    pub async fn bind(listen: SocketAddr, target: String) -> io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        Ok(Self { listener, target })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Accepts until `shutdown` is cancelled. Errors on individual
    /// connections never stop the loop.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            addr = ?self.listener.local_addr().ok(),
            target = %self.target,
            "Proxy listening"
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((inbound, peer)) => {
                    debug!(%peer, "Accepted connection");
                    let target = self.target.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = relay(inbound, &target) => {}
                        }
                        debug!(%peer, "Connection closed");
                    });
                }
                Err(e) => {
                    // usually fd exhaustion; give in-flight relays a moment to release
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("Proxy stopped");
    }
}

/// Pipes bytes both ways. EOF on one side is passed on as a write shutdown
/// to the other, so half-closed request/response exchanges complete; an
/// error in either direction drops both sockets.
async fn relay(mut inbound: TcpStream, target: &str) {
    let mut outbound = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%target, error = %e, "Failed to reach instance");
            return;
        }
    };

    match io::copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((sent, received)) => debug!(sent, received, "Relay finished"),
        Err(e) => debug!(error = %e, "Relay aborted"),
    }
}
