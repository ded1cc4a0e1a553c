use std::{future::Future, net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, error, info};

use crate::error::{Result, TunnelError};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A bound TCP listener and the task accepting on it.
///
/// Every accepted connection is handed to the handler in its own task, so
/// closing the listener never interrupts connections already accepted.
pub struct Listening {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Listening {
    pub async fn bind<F, Fut>(address: &str, handler: F) -> Result<Self>
    where
        F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| TunnelError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(listen_addr = %local_addr, "Listening");

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, listen_addr = %local_addr, "Accepted connection");
                        tokio::spawn(handler(stream, peer));
                    }
                    Err(e) => {
                        error!(listen_addr = %local_addr, error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        });

        Ok(Self { local_addr, task })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and releases the port once this returns.
    pub async fn close(self) {
        self.task.abort();
        let _ = self.task.await;
        info!(listen_addr = %self.local_addr, "Stopped listening");
    }
}
