//! Host-side SSH agent-forwarding proxy
//!
//! Bridges the host SSH agent into the container: a TCP listener accepts
//! connections (from the in-container companion) and splices each one onto
//! a fresh connection to the host agent's Unix socket. Closure of either
//! direction tears down both. The accept loop and the per-connection
//! forwarders are separate tasks, all signalled through one cancellation
//! token and joined on shutdown; socket closure alone is never relied on.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{Result, SshError};

/// Environment variable naming the host agent socket.
pub const AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";

/// Locate the host agent socket: `SSH_AUTH_SOCK` must be set and name a
/// Unix socket.
pub fn host_agent_socket() -> Result<PathBuf> {
    let value = std::env::var(AUTH_SOCK_ENV).map_err(|_| SshError::AgentUnavailable {
        message: format!("{} is not set", AUTH_SOCK_ENV),
    })?;
    let path = PathBuf::from(value);

    let metadata = std::fs::metadata(&path).map_err(|e| SshError::AgentUnavailable {
        message: format!("{}: {}", path.display(), e),
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            return Err(SshError::AgentUnavailable {
                message: format!("{} is not a socket", path.display()),
            }
            .into());
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    Ok(path)
}

/// The address to listen on. On native Linux the default bridge gateway is
/// reachable from containers; Docker-Desktop-class runtimes resolve
/// `host.docker.internal` to the loopback-bound listener instead.
pub fn proxy_bind_address(native_linux: bool) -> IpAddr {
    if native_linux {
        IpAddr::V4(Ipv4Addr::new(172, 17, 0, 1))
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }
}

/// A running agent-forwarding proxy.
pub struct AgentProxy {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl AgentProxy {
    /// Bind an ephemeral port on `bind_addr` and start accepting.
    #[instrument(skip(cancel), fields(agent = %agent_socket.display()))]
    pub async fn start(
        agent_socket: PathBuf,
        bind_addr: IpAddr,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind((bind_addr, 0))
            .await
            .map_err(|e| SshError::Proxy {
                message: format!("bind {}: {}", bind_addr, e),
            })?;
        let local_addr = listener.local_addr().map_err(|e| SshError::Proxy {
            message: e.to_string(),
        })?;
        info!(addr = %local_addr, "agent proxy listening");

        let token = cancel.child_token();
        let loop_token = token.clone();
        let accept_task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "proxy connection accepted");
                            let conn_token = loop_token.clone();
                            let socket = agent_socket.clone();
                            connections.spawn(async move {
                                if let Err(e) = forward(stream, &socket, &conn_token).await {
                                    debug!(error = %e, "proxy connection ended");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    },
                }
            }
            drop(listener);
            // Forwarders watch the same token; join them all.
            while connections.join_next().await.is_some() {}
        });

        Ok(Self {
            local_addr,
            cancel: token,
            accept_task,
        })
    }

    /// Where the listener is bound; the container-side agent dials this.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, tear down active connections, and join every task.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.accept_task.await;
        info!("agent proxy stopped");
    }
}

/// Splice one accepted connection onto the agent socket until either side
/// closes or the token fires.
async fn forward(
    mut tcp: TcpStream,
    agent_socket: &std::path::Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut unix = UnixStream::connect(agent_socket)
        .await
        .map_err(|e| SshError::Proxy {
            message: format!("connect {}: {}", agent_socket.display(), e),
        })?;

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = tokio::io::copy_bidirectional(&mut tcp, &mut unix) => {
            result.map(|_| ()).map_err(|e| SshError::Proxy {
                message: e.to_string(),
            }.into())
        }
    }
}
