//! The tracker's ASCII request grammar and status-coded response framing.
//!
//! Requests are space-separated tokens with an optional JSON payload
//! appended; responses lead with a three-digit status code peers dispatch
//! on, following HTTP's 2xx/4xx/5xx convention (see the teacher's own
//! status-prefixed tracker responses, generalized from bencode to JSON
//! here).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::state::{FileEntry, PeerId, StateError};

#[derive(Debug)]
pub enum Request {
    RegisterLeecher { username: String },
    RegisterSeeder {
        username: String,
        peer_tcp_port: u16,
        files: Vec<FileEntry>,
    },
    UpdateFiles {
        username: String,
        peer_tcp_port: u16,
        files: Vec<FileEntry>,
    },
    ChangeUsername { old: String, new: String },
    KeepAlive { username: String },
    Disconnect { username: String },
    ListActive,
    ListFiles,
    GetPeers { filename: String },
    Ping,
}

#[derive(Debug)]
pub struct ParseError(pub String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parses one UDP datagram into a [`Request`]. Returns a [`ParseError`] for
/// any malformed or unrecognized grammar.
pub fn parse_request(datagram: &[u8]) -> Result<Request, ParseError> {
    let text = std::str::from_utf8(datagram)
        .map_err(|_| ParseError("request is not valid UTF-8".into()))?;
    let mut parts = text.trim_end().splitn(2, ' ');
    let command = parts
        .next()
        .ok_or_else(|| ParseError("empty request".into()))?;
    let rest = parts.next().unwrap_or("").trim();

    match command {
        "PING" => Ok(Request::Ping),
        "LIST_ACTIVE" => Ok(Request::ListActive),
        "LIST_FILES" => Ok(Request::ListFiles),
        "GET_PEERS" => {
            let filename = rest
                .split_whitespace()
                .next()
                .ok_or_else(|| ParseError("GET_PEERS requires a filename".into()))?;
            Ok(Request::GetPeers {
                filename: filename.to_string(),
            })
        }
        "KEEP_ALIVE" => {
            let username = rest
                .split_whitespace()
                .next()
                .ok_or_else(|| ParseError("KEEP_ALIVE requires a username".into()))?;
            Ok(Request::KeepAlive {
                username: username.to_string(),
            })
        }
        "DISCONNECT" => {
            let username = rest
                .split_whitespace()
                .next()
                .ok_or_else(|| ParseError("DISCONNECT requires a username".into()))?;
            Ok(Request::Disconnect {
                username: username.to_string(),
            })
        }
        "CHANGE_USERNAME" => {
            let mut tokens = rest.split_whitespace();
            let old = tokens
                .next()
                .ok_or_else(|| ParseError("CHANGE_USERNAME requires an old username".into()))?;
            let new = tokens
                .next()
                .ok_or_else(|| ParseError("CHANGE_USERNAME requires a new username".into()))?;
            // a trailing address token may be present for the caller's own
            // bookkeeping; the tracker trusts the datagram's source address
            // instead and ignores it here.
            Ok(Request::ChangeUsername {
                old: old.to_string(),
                new: new.to_string(),
            })
        }
        "REGISTER" => {
            let mut tokens = rest.splitn(3, ' ');
            let role = tokens
                .next()
                .ok_or_else(|| ParseError("REGISTER requires a role".into()))?;
            let username = tokens
                .next()
                .ok_or_else(|| ParseError("REGISTER requires a username".into()))?;
            match role {
                "leecher" => Ok(Request::RegisterLeecher {
                    username: username.to_string(),
                }),
                "seeder" => {
                    let json = tokens
                        .next()
                        .ok_or_else(|| ParseError("REGISTER seeder requires a files payload".into()))?;
                    let payload: FilesPayload = serde_json::from_str(json)
                        .map_err(|e| ParseError(format!("invalid files payload: {}", e)))?;
                    Ok(Request::RegisterSeeder {
                        username: username.to_string(),
                        peer_tcp_port: payload.peer_tcp_port,
                        files: payload.files,
                    })
                }
                other => Err(ParseError(format!("unknown REGISTER role {}", other))),
            }
        }
        "UPDATE_FILES" => {
            let mut tokens = rest.splitn(2, ' ');
            let username = tokens
                .next()
                .ok_or_else(|| ParseError("UPDATE_FILES requires a username".into()))?;
            let json = tokens
                .next()
                .ok_or_else(|| ParseError("UPDATE_FILES requires a files payload".into()))?;
            let payload: FilesPayload = serde_json::from_str(json)
                .map_err(|e| ParseError(format!("invalid files payload: {}", e)))?;
            Ok(Request::UpdateFiles {
                username: username.to_string(),
                peer_tcp_port: payload.peer_tcp_port,
                files: payload.files,
            })
        }
        other => Err(ParseError(format!("unknown command {}", other))),
    }
}

#[derive(Serialize, Deserialize)]
struct FilesPayload {
    peer_tcp_port: u16,
    files: Vec<FileEntry>,
}

#[derive(Debug)]
pub enum Response {
    Registered { peer_id: PeerId },
    FilesUpdated,
    UsernameChanged,
    KeptAlive,
    Disconnected,
    Pong,
    ListActive { seeders: Vec<String>, leechers: Vec<String> },
    ListFiles { files: HashMap<String, u64> },
    Peers {
        filename: String,
        size: u64,
        checksum: String,
        seeders: Vec<(String, u16, PeerId)>,
    },
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
}

impl Response {
    /// Serializes the response to the bytes written back to the peer. The
    /// first three bytes of every non-JSON-only response are the numeric
    /// status code.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::Registered { peer_id } => {
                format!("201 Registered {{\"peer_id\":{}}}", peer_id).into_bytes()
            }
            Response::FilesUpdated => b"200 Files updated".to_vec(),
            Response::UsernameChanged => b"200 USERNAME_CHANGED".to_vec(),
            Response::KeptAlive => b"200 OK".to_vec(),
            Response::Disconnected => b"200 Disconnected".to_vec(),
            Response::Pong => b"200 OK: PONG".to_vec(),
            Response::ListActive { seeders, leechers } => {
                let body = serde_json::json!({ "seeders": seeders, "leechers": leechers });
                body.to_string().into_bytes()
            }
            Response::ListFiles { files } => serde_json::json!(files).to_string().into_bytes(),
            Response::Peers {
                filename,
                size,
                checksum,
                seeders,
            } => {
                let body = serde_json::json!({
                    "status": "200 OK",
                    "filename": filename,
                    "size": size,
                    "checksum": checksum,
                    "seeders": seeders,
                });
                body.to_string().into_bytes()
            }
            Response::NotFound(msg) => format!("404 {}", msg).into_bytes(),
            Response::BadRequest(msg) => format!("400 {}", msg).into_bytes(),
            Response::Forbidden(msg) => format!("403 {}", msg).into_bytes(),
            Response::Conflict(msg) => format!("409 {}", msg).into_bytes(),
        }
    }
}

impl From<StateError> for Response {
    fn from(e: StateError) -> Self {
        match e {
            StateError::AdmissionDenied => Response::Forbidden("peer limit reached".into()),
            StateError::DuplicateName => Response::Conflict("username already registered".into()),
            StateError::NotFound => Response::NotFound("peer not registered".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        assert!(matches!(parse_request(b"PING").unwrap(), Request::Ping));
    }

    #[test]
    fn test_parse_register_leecher() {
        match parse_request(b"REGISTER leecher alice").unwrap() {
            Request::RegisterLeecher { username } => assert_eq!(username, "alice"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_register_seeder_with_files() {
        let datagram = br#"REGISTER seeder alice {"peer_tcp_port":12000,"files":[{"filename":"a.bin","size":10,"checksum":"abc"}]}"#;
        match parse_request(datagram).unwrap() {
            Request::RegisterSeeder { username, files, .. } => {
                assert_eq!(username, "alice");
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].filename, "a.bin");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_get_peers() {
        match parse_request(b"GET_PEERS a.bin").unwrap() {
            Request::GetPeers { filename } => assert_eq!(filename, "a.bin"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_command_is_error() {
        assert!(parse_request(b"FROBNICATE x").is_err());
    }

    #[test]
    fn test_response_status_prefix() {
        let bytes = Response::Forbidden("peer limit reached".into()).to_bytes();
        assert_eq!(&bytes[..3], b"403");
    }
}
