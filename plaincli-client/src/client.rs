//! High-level client: one remote command per connection.

use crate::connection::ConnectionConfig;
use crate::error::ClientError;
use crate::request::Request;
use crate::session::{ClientSide, Outcome};
use plaincli_protocol::{FramedReader, FramedWriter};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// plaincli client.
#[derive(Debug, Clone)]
pub struct Client {
    config: ConnectionConfig,
}

impl Client {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Runs `request` on the server with the given local streams.
    pub async fn run<I, O, E>(
        &self,
        request: &Request,
        stdin: I,
        stdout: O,
        stderr: E,
    ) -> Result<Outcome, ClientError>
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let stream = self.config.connect().await?;
        let label = self.config.addr.to_string();
        let (read_half, write_half) = stream.into_split();

        let (reader, events) = FramedReader::new(read_half, label.clone())
            .with_read_buffer_size(self.config.read_buffer_size)
            .spawn();
        let writer = Arc::new(FramedWriter::new(write_half));

        let mut side =
            ClientSide::new(writer.clone(), label).with_ping_interval(self.config.ping_interval);
        let outcome = match side.start(request).await {
            Ok(()) => side.run(events, stdin, stdout, stderr).await,
            Err(e) => Err(e),
        };

        reader.abort();
        let _ = writer.shutdown().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use plaincli_protocol::{CloseReason, Decoder, Frame};
    use plaincli_server::{Builtins, Server, ServerConfig};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn start_server() -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(ServerConfig::new(addr), Arc::new(Builtins)));
        let running = server.clone();
        tokio::spawn(async move { running.serve_listener(listener).await });
        (server, addr)
    }

    #[tokio::test]
    async fn test_exit_status_propagates() {
        let (server, addr) = start_server().await;
        let client = Client::new(ConnectionConfig::new(addr));

        for code in [0, 1, -1, 255] {
            let request = Request::new(["exit".to_string(), code.to_string()]);
            let outcome = client
                .run(
                    &request,
                    tokio::io::empty(),
                    tokio::io::sink(),
                    tokio::io::sink(),
                )
                .await
                .unwrap();
            assert_eq!(outcome.exit_code, Some(code));
            assert!(outcome.close.is_clean());
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_stdin_round_trip_through_cat() {
        let (server, addr) = start_server().await;
        let client = Client::new(ConnectionConfig::new(addr));

        let input: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (mut local_stdin, stdin) = tokio::io::duplex(16 * 1024);
        let feeder = {
            let input = input.clone();
            tokio::spawn(async move {
                local_stdin.write_all(&input).await.unwrap();
            })
        };

        let mut stdout = Vec::new();
        let outcome = client
            .run(
                &Request::from_env(["cat"]),
                stdin,
                &mut stdout,
                tokio::io::sink(),
            )
            .await
            .unwrap();
        feeder.await.unwrap();

        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(stdout, input);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_command_over_tcp() {
        let (server, addr) = start_server().await;
        let client = Client::new(ConnectionConfig::new(addr));

        let mut stderr = Vec::new();
        let outcome = client
            .run(
                &Request::new(["frobnicate"]),
                tokio::io::empty(),
                tokio::io::sink(),
                &mut stderr,
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(2));
        assert_eq!(stderr, b"No such command frobnicate\n");
        server.shutdown();
    }

    #[tokio::test]
    async fn test_corrupt_server_gives_no_exit_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Wait for START, then answer with garbage.
            let mut decoder = Decoder::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                decoder.extend(&buf[..n]);
                let mut started = false;
                while let Some(frame) = decoder.decode_frame().unwrap() {
                    started |= frame == Frame::Start;
                }
                if started {
                    break;
                }
            }
            let mut reply = Frame::Stdout(Bytes::from_static(b"ok")).encode().unwrap();
            reply.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
            socket.write_all(&reply).await.unwrap();
            socket.shutdown().await.unwrap();
            // Keep reading so the client sees EOF rather than a reset.
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let mut stdout = Vec::new();
        let outcome = Client::new(ConnectionConfig::new(addr))
            .run(
                &Request::new(["anything"]),
                tokio::io::empty(),
                &mut stdout,
                tokio::io::sink(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, None);
        assert_eq!(stdout, b"ok");
        assert!(matches!(outcome.close, CloseReason::Corrupt(_)));
    }
}
