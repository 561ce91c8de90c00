//! Socket backend
//!
//! Connects to a language server that is already listening on a TCP port
//! or a Unix domain socket. Nothing is spawned; teardown is closing the
//! connection.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::info;

use crate::io::transport::StreamTransport;
use crate::server::error::BackendError;
use crate::server::{RunningServer, ServerBackend};
use crate::workspace::Workspace;

/// Where the server listens
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEndpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl std::fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketEndpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            SocketEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Language server reached over an existing socket
#[derive(Debug, Clone)]
pub struct SocketServer {
    pub endpoint: SocketEndpoint,
}

impl SocketServer {
    pub fn tcp<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            endpoint: SocketEndpoint::Tcp {
                host: host.into(),
                port,
            },
        }
    }

    pub fn unix<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            endpoint: SocketEndpoint::Unix(path.into()),
        }
    }

    async fn connect(&self) -> Result<StreamTransport, BackendError> {
        match &self.endpoint {
            SocketEndpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|source| BackendError::ConnectionFailed {
                        endpoint: self.endpoint.to_string(),
                        source,
                    })?;
                Ok(StreamTransport::from_tcp(stream))
            }
            SocketEndpoint::Unix(path) => {
                #[cfg(unix)]
                {
                    let stream = UnixStream::connect(path).await.map_err(|source| {
                        BackendError::ConnectionFailed {
                            endpoint: self.endpoint.to_string(),
                            source,
                        }
                    })?;
                    Ok(StreamTransport::from_unix(stream))
                }
                #[cfg(not(unix))]
                {
                    let _ = path;
                    Err(BackendError::UnixSocketsUnsupported)
                }
            }
        }
    }
}

#[async_trait]
impl ServerBackend for SocketServer {
    fn name(&self) -> String {
        format!("socket({})", self.endpoint)
    }

    /// Availability is a successful connect; the probe connection is
    /// dropped immediately.
    async fn check_availability(&self) -> Result<(), BackendError> {
        let mut probe = self.connect().await?;
        use crate::io::transport::Transport as _;
        let _ = probe.close().await;
        Ok(())
    }

    async fn start(&self, _workspace: &Workspace) -> Result<RunningServer, BackendError> {
        info!("Connecting to server at {}", self.endpoint);
        let transport = self.connect().await?;
        Ok(RunningServer::from_transport(self.name(), transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_listener() -> (tokio::net::TcpListener, u16) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_tcp_availability_and_start() {
        let (listener, port) = spawn_listener().await;
        let accept_task = tokio::spawn(async move {
            // One connection for the probe, one for the session
            let _ = listener.accept().await;
            let _ = listener.accept().await;
        });

        let server = SocketServer::tcp("127.0.0.1", port);
        server.check_availability().await.unwrap();

        let mut running = server.start(&Workspace::single("/tmp")).await.unwrap();
        assert!(running.take_transport().is_some());
        running.stop().await;

        accept_task.abort();
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let (listener, port) = spawn_listener().await;
        drop(listener);

        let server = SocketServer::tcp("127.0.0.1", port);
        match server.check_availability().await {
            Err(BackendError::ConnectionFailed { endpoint, .. }) => {
                assert_eq!(endpoint, format!("tcp://127.0.0.1:{port}"));
            }
            other => panic!("Expected ConnectionFailed, got: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let accept_task = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let server = SocketServer::unix(&path);
        let mut running = server.start(&Workspace::single("/tmp")).await.unwrap();
        assert!(running.take_transport().is_some());
        running.stop().await;

        accept_task.abort();
    }
}
