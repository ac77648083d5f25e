//! Connection management.

use crate::error::ClientError;
use plaincli_protocol::reader::DEFAULT_READ_BUFFER_SIZE;
use plaincli_protocol::DEFAULT_PORT;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Keepalive interval the command-line client uses unless told otherwise.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(3);

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Keepalive interval while a command runs (None = no keepalive).
    pub ping_interval: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)))
    }
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            ping_interval: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Opens a TCP connection to the server.
    pub async fn connect(&self) -> Result<TcpStream, ClientError> {
        tracing::debug!("Connecting to {}...", self.addr);

        let tcp_stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::Timeout
            })?
            .map_err(|e| {
                tracing::debug!("Connection failed: {}", e);
                ClientError::Io(e)
            })?;

        tcp_stream.set_nodelay(true).ok();
        tracing::debug!("Connected to {}", self.addr);
        Ok(tcp_stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.addr.port(), DEFAULT_PORT);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert!(config.ping_interval.is_none());
    }

    #[test]
    fn test_read_buffer_size_is_clamped() {
        let config = ConnectionConfig::default().with_read_buffer_size(1);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);
        let config = ConnectionConfig::default().with_read_buffer_size(usize::MAX);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = ConnectionConfig::new(addr).connect().await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
