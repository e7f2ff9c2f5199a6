//! The peer server's request framing: one ASCII line per connection,
//! decoded into a [`PeerRequest`]. Used with `tokio_util::codec::FramedRead`
//! so the server can read a line with the same buffering discipline the
//! teacher uses for its handshake and message codecs, then hand the raw
//! `TcpStream` back for writing a reply whose shape (text, JSON, or a raw
//! byte stream) depends on which request arrived.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerRequest {
    Ping,
    RequestMetadata { filename: String },
    RequestChunk { filename: String, chunk_id: usize },
}

/// Parses a single request line (without its trailing newline).
pub fn parse_peer_request(line: &str) -> Result<PeerRequest> {
    let mut tokens = line.split_whitespace();
    let command = tokens
        .next()
        .ok_or_else(|| Error::ProtocolViolation("empty request".into()))?;
    match command {
        "PING" => Ok(PeerRequest::Ping),
        "REQUEST_METADATA" => {
            let filename = tokens.next().ok_or_else(|| {
                Error::ProtocolViolation("REQUEST_METADATA requires a filename".into())
            })?;
            Ok(PeerRequest::RequestMetadata {
                filename: filename.to_string(),
            })
        }
        "REQUEST_CHUNK" => {
            let filename = tokens.next().ok_or_else(|| {
                Error::ProtocolViolation("REQUEST_CHUNK requires a filename".into())
            })?;
            let chunk_id = tokens
                .next()
                .ok_or_else(|| Error::ProtocolViolation("REQUEST_CHUNK requires a chunk id".into()))?
                .parse::<usize>()
                .map_err(|_| Error::ProtocolViolation("chunk id is not a number".into()))?;
            Ok(PeerRequest::RequestChunk {
                filename: filename.to_string(),
                chunk_id,
            })
        }
        other => Err(Error::ProtocolViolation(format!("unknown request {}", other))),
    }
}

/// Decodes a newline-delimited request line off the wire.
pub struct RequestCodec;

impl Decoder for RequestCodec {
    type Item = PeerRequest;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let newline_pos = src.iter().position(|&b| b == b'\n');
        let pos = match newline_pos {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let line = src.split_to(pos + 1);
        let line = std::str::from_utf8(&line[..line.len() - 1])
            .map_err(|_| Error::ProtocolViolation("request is not valid UTF-8".into()))?;
        parse_peer_request(line).map(Some)
    }
}

/// The literal sentinel a server writes (and a client must recognize as the
/// very first bytes of a `REQUEST_CHUNK` response) in place of the chunk's
/// bytes when the chunk or file is unknown.
pub const CHUNK_NOT_FOUND: &[u8] = b"CHUNK_NOT_FOUND";
/// The literal sentinel for a `REQUEST_METADATA` response naming an unknown
/// file.
pub const FILE_NOT_FOUND: &[u8] = b"FILE_NOT_FOUND";
/// The literal sentinel for a `REQUEST_METADATA` response when the file is
/// known but its metadata could not be produced.
pub const METADATA_NOT_AVAILABLE: &[u8] = b"METADATA_NOT_AVAILABLE";
/// The literal `PING` reply.
pub const PONG: &[u8] = b"PONG";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        assert_eq!(parse_peer_request("PING").unwrap(), PeerRequest::Ping);
    }

    #[test]
    fn test_parse_request_metadata() {
        assert_eq!(
            parse_peer_request("REQUEST_METADATA a.bin").unwrap(),
            PeerRequest::RequestMetadata {
                filename: "a.bin".into()
            }
        );
    }

    #[test]
    fn test_parse_request_chunk() {
        assert_eq!(
            parse_peer_request("REQUEST_CHUNK a.bin 3").unwrap(),
            PeerRequest::RequestChunk {
                filename: "a.bin".into(),
                chunk_id: 3,
            }
        );
    }

    #[test]
    fn test_parse_request_chunk_rejects_non_numeric_id() {
        assert!(parse_peer_request("REQUEST_CHUNK a.bin not-a-number").is_err());
    }

    #[test]
    fn test_decoder_waits_for_full_line() {
        let mut codec = RequestCodec;
        let mut buf = BytesMut::from(&b"PING"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(PeerRequest::Ping));
    }
}
