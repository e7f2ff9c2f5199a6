//! A thin UDP request/response client for the tracker protocol, shared by
//! the peer lifecycle (registration, keep-alive, rescans) and the
//! downloader (peer lookups). Centralizing framing, timeouts and
//! status-code parsing here means neither caller duplicates socket
//! handling, mirroring the teacher's pattern of a single narrow client type
//! wrapping a raw socket.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, time::timeout};

use crate::{
    conf::TrackerClientConf,
    error::{Error, Result},
    tracker::state::PeerId,
};

/// A single file a seeder advertises, serialized the same way the
/// tracker's own `FileEntry` is.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileAd {
    pub filename: String,
    pub size: u64,
    pub checksum: String,
}

/// One seeder entry from a `GET_PEERS` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeederListing {
    pub host: String,
    pub tcp_port: u16,
    pub peer_id: PeerId,
}

/// The full decoded response to `GET_PEERS`.
#[derive(Clone, Debug)]
pub struct PeerListing {
    pub filename: String,
    pub size: u64,
    pub checksum: String,
    pub seeders: Vec<SeederListing>,
}

/// A UDP client bound to a single tracker, built once at peer startup and
/// reused (behind an `Arc`) across every subsequent request the owning peer
/// makes — registration, keep-alive, rescans, downloads, all of it.
///
/// This matters beyond connection reuse: the tracker keys a peer's record by
/// the UDP source address of the datagram that registered it (see
/// `tracker::mod::handle_datagram`), and `PeerAddress` is defined (§3) as a
/// *stable* identifier across tracker interactions. Binding a fresh ephemeral
/// socket per request would register from one source port and then send
/// `KEEP_ALIVE`/`UPDATE_FILES`/`DISCONNECT` from others, none of which would
/// match the registered record. One socket, bound once, is what keeps the
/// address stable.
///
/// Since every caller now shares the one socket, `request_lock` serializes
/// the send/receive pair of each call so two requests in flight at once
/// (e.g. a keep-alive tick racing a download's `GET_PEERS`) can't have their
/// responses cross-delivered — the wire protocol carries no request id to
/// tell them apart.
pub struct TrackerClient {
    socket: UdpSocket,
    request_timeout: Duration,
    request_lock: tokio::sync::Mutex<()>,
}

impl TrackerClient {
    /// Binds this peer's single UDP socket and connects it to the tracker
    /// named in `conf`. `connect` on a UDP socket just fixes the default
    /// peer for `send`/`recv`; it performs no handshake. Call this once per
    /// peer and share the result.
    pub async fn connect(conf: &TrackerClientConf) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let tracker_addr = SocketAddr::new(conf.tracker_host, conf.tracker_udp_port);
        socket.connect(tracker_addr).await?;
        Ok(Self {
            socket,
            request_timeout: conf.request_timeout,
            request_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the local address this client's socket is bound to. Used to
    /// fill the trailing, server-ignored address token `CHANGE_USERNAME`
    /// carries on the wire.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn register_leecher(&self, username: &str) -> Result<PeerId> {
        let response = self
            .request(&format!("REGISTER leecher {}", username))
            .await?;
        expect_peer_id(&response)
    }

    pub async fn register_seeder(
        &self,
        username: &str,
        peer_tcp_port: u16,
        files: &[FileAd],
    ) -> Result<PeerId> {
        let payload = serde_json::json!({ "peer_tcp_port": peer_tcp_port, "files": files });
        let response = self
            .request(&format!("REGISTER seeder {} {}", username, payload))
            .await?;
        expect_peer_id(&response)
    }

    pub async fn update_files(
        &self,
        username: &str,
        peer_tcp_port: u16,
        files: &[FileAd],
    ) -> Result<()> {
        let payload = serde_json::json!({ "peer_tcp_port": peer_tcp_port, "files": files });
        let response = self
            .request(&format!("UPDATE_FILES {} {}", username, payload))
            .await?;
        expect_success(&response)
    }

    pub async fn change_username(&self, old: &str, new: &str, own_addr: SocketAddr) -> Result<()> {
        let response = self
            .request(&format!("CHANGE_USERNAME {} {} {}", old, new, own_addr))
            .await?;
        expect_success(&response)
    }

    pub async fn keep_alive(&self, username: &str) -> Result<()> {
        let response = self.request(&format!("KEEP_ALIVE {}", username)).await?;
        expect_success(&response)
    }

    pub async fn disconnect(&self, username: &str) -> Result<()> {
        let response = self.request(&format!("DISCONNECT {}", username)).await?;
        expect_success(&response)
    }

    pub async fn ping(&self) -> Result<()> {
        let response = self.request("PING").await?;
        expect_success(&response)
    }

    pub async fn list_active(&self) -> Result<(Vec<String>, Vec<String>)> {
        let response = self.request("LIST_ACTIVE").await?;
        #[derive(Deserialize)]
        struct Body {
            seeders: Vec<String>,
            leechers: Vec<String>,
        }
        let body: Body = serde_json::from_str(&response)?;
        Ok((body.seeders, body.leechers))
    }

    pub async fn list_files(&self) -> Result<HashMap<String, u64>> {
        let response = self.request("LIST_FILES").await?;
        Ok(serde_json::from_str(&response)?)
    }

    pub async fn get_peers(&self, filename: &str) -> Result<PeerListing> {
        let response = self.request(&format!("GET_PEERS {}", filename)).await?;
        if !is_json(&response) {
            return Err(status_error(&response));
        }
        #[derive(Deserialize)]
        struct Body {
            filename: String,
            size: u64,
            checksum: String,
            seeders: Vec<(String, u16, PeerId)>,
        }
        let body: Body = serde_json::from_str(&response)?;
        Ok(PeerListing {
            filename: body.filename,
            size: body.size,
            checksum: body.checksum,
            seeders: body
                .seeders
                .into_iter()
                .map(|(host, tcp_port, peer_id)| SeederListing {
                    host,
                    tcp_port,
                    peer_id,
                })
                .collect(),
        })
    }

    async fn request(&self, message: &str) -> Result<String> {
        let _guard = self.request_lock.lock().await;
        self.socket.send(message.as_bytes()).await?;
        let mut buf = vec![0u8; 4096];
        let len = timeout(self.request_timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Timeout)??;
        String::from_utf8(buf[..len].to_vec())
            .map_err(|_| Error::ProtocolViolation("tracker response is not valid UTF-8".into()))
    }
}

fn is_json(response: &str) -> bool {
    response.trim_start().starts_with('{')
}

fn status_code(response: &str) -> Result<u16> {
    response
        .get(..3)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::ProtocolViolation("missing status code".into()))
}

fn status_error(response: &str) -> Error {
    match status_code(response) {
        Ok(403) => Error::AdmissionDenied,
        Ok(404) => Error::NotFound,
        Ok(409) => Error::DuplicateName,
        Ok(code) if (200..300).contains(&code) => {
            Error::ProtocolViolation(format!("unexpected success status in error path: {}", response))
        }
        Ok(_) => Error::ProtocolViolation(response.to_string()),
        Err(e) => e,
    }
}

fn expect_success(response: &str) -> Result<()> {
    match status_code(response) {
        Ok(code) if (200..300).contains(&code) => Ok(()),
        _ => Err(status_error(response)),
    }
}

fn expect_peer_id(response: &str) -> Result<PeerId> {
    expect_success(response)?;
    let brace = response
        .find('{')
        .ok_or_else(|| Error::ProtocolViolation("registration response missing payload".into()))?;
    #[derive(Deserialize)]
    struct Body {
        peer_id: PeerId,
    }
    let body: Body = serde_json::from_str(&response[brace..])?;
    Ok(body.peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_parses_leading_digits() {
        assert_eq!(status_code("201 Registered").unwrap(), 201);
        assert_eq!(status_code("404 not found").unwrap(), 404);
    }

    #[test]
    fn test_expect_peer_id_extracts_trailing_json() {
        let response = "201 Registered {\"peer_id\":42}";
        assert_eq!(expect_peer_id(response).unwrap(), 42);
    }

    #[test]
    fn test_expect_success_rejects_error_status() {
        assert!(expect_success("409 username already registered").is_err());
    }

    #[test]
    fn test_is_json_detects_brace_prefix() {
        assert!(is_json("{\"seeders\":[]}"));
        assert!(!is_json("200 OK"));
    }
}
