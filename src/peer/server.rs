//! The peer's TCP serving side: one accept loop spawning one task per
//! connection, mirroring the teacher's per-`PeerSession` task model but
//! collapsed to a single request/response instead of a long-lived session,
//! since this protocol never multiplexes more than one request per
//! connection.

use std::net::SocketAddr;

use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tokio_util::codec::FramedRead;

use crate::{
    error::Result,
    store::StoreHandle,
};

use super::codec::{
    PeerRequest, RequestCodec, CHUNK_NOT_FOUND, FILE_NOT_FOUND, METADATA_NOT_AVAILABLE, PONG,
};

/// The running TCP server. Build with [`PeerServer::bind`], then drive it
/// forever with [`PeerServer::run`].
pub struct PeerServer {
    listener: TcpListener,
    store: StoreHandle,
}

impl PeerServer {
    /// Binds the server's TCP listener on `port` across all interfaces.
    pub async fn bind(port: u16, store: StoreHandle) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        log::info!("Peer server listening on {}", addr);
        Ok(Self { listener, store })
    }

    /// Returns the bound local address (useful when `port` was `0`).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections forever, spawning one task per connection. Each
    /// task handles exactly one request and then the connection closes.
    pub async fn run(self) -> Result<()> {
        loop {
            let (socket, addr) = self.listener.accept().await?;
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, store).await {
                    log::warn!("Connection from {} failed: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(socket: TcpStream, store: StoreHandle) -> Result<()> {
    let mut framed = FramedRead::new(socket, RequestCodec);
    let request = match framed.next().await {
        Some(request) => request?,
        None => return Ok(()),
    };
    let mut socket = framed.into_inner();

    match request {
        PeerRequest::Ping => {
            socket.write_all(PONG).await?;
        }
        PeerRequest::RequestMetadata { filename } => match store.get_metadata(&filename).await {
            Ok(metadata) => {
                let json = serde_json::to_vec(&metadata)?;
                socket.write_all(&json).await?;
            }
            Err(crate::error::Error::NotFound) => {
                socket.write_all(FILE_NOT_FOUND).await?;
            }
            Err(e) => {
                log::warn!("Failed to serve metadata for {}: {}", filename, e);
                socket.write_all(METADATA_NOT_AVAILABLE).await?;
            }
        },
        PeerRequest::RequestChunk { filename, chunk_id } => {
            match store.read_chunk(&filename, chunk_id).await {
                Ok(bytes) => {
                    socket.write_all(&bytes).await?;
                }
                Err(e) => {
                    log::debug!(
                        "No chunk {} of {} to serve: {}",
                        chunk_id,
                        filename,
                        e
                    );
                    socket.write_all(CHUNK_NOT_FOUND).await?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chunk, conf::StoreConf, store::Store};
    use tokio::io::AsyncReadExt;

    async fn spawn_server_with_file(filename: &str, content: &[u8]) -> SocketAddr {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(filename), content).unwrap();
        let conf = StoreConf::new(dir.path());
        let (store, handle) = Store::new(&conf);
        tokio::spawn(store.run());
        handle.scan().await.unwrap();
        // keep the tempdir alive for the duration of the test process by leaking it
        std::mem::forget(dir);

        let server = PeerServer::bind(0, handle).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    async fn request(addr: SocketAddr, line: &str) -> Vec<u8> {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(line.as_bytes()).await.unwrap();
        socket.write_all(b"\n").await.unwrap();
        let mut buf = Vec::new();
        socket.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_ping_replies_pong() {
        let addr = spawn_server_with_file("f.bin", b"hello").await;
        let response = request(addr, "PING").await;
        assert_eq!(response, PONG);
    }

    #[tokio::test]
    async fn test_request_metadata_for_known_file() {
        let addr = spawn_server_with_file("f.bin", b"hello world").await;
        let response = request(addr, "REQUEST_METADATA f.bin").await;
        let metadata: chunk::FileMetadata = serde_json::from_slice(&response).unwrap();
        assert_eq!(metadata.size, 11);
    }

    #[tokio::test]
    async fn test_request_metadata_for_unknown_file() {
        let addr = spawn_server_with_file("f.bin", b"hello").await;
        let response = request(addr, "REQUEST_METADATA missing.bin").await;
        assert_eq!(response, FILE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_request_chunk_returns_exact_bytes() {
        let addr = spawn_server_with_file("f.bin", b"hello world").await;
        let response = request(addr, "REQUEST_CHUNK f.bin 0").await;
        assert_eq!(response, b"hello world");
    }

    #[tokio::test]
    async fn test_request_chunk_unknown_id_returns_sentinel() {
        let addr = spawn_server_with_file("f.bin", b"hello").await;
        let response = request(addr, "REQUEST_CHUNK f.bin 99").await;
        assert_eq!(response, CHUNK_NOT_FOUND);
    }
}
