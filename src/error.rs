//! The crate's error type and the `Result` alias used throughout.

use std::{fmt, io};

/// The result type returned by most of the crate's fallible operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors that may occur in the tracker, the chunk store, or a peer's
/// server/client paths.
#[derive(Debug)]
pub enum Error {
    /// The requested filename, chunk id, or peer address is not known.
    NotFound,
    /// A seeder did not respond (or responded with garbage) to a request;
    /// this drives the downloader's availability bookkeeping.
    Unavailable,
    /// A connect or read deadline elapsed.
    Timeout,
    /// A peer or tracker sent a request/response that doesn't parse
    /// according to the wire grammar.
    ProtocolViolation(String),
    /// A chunk's or a whole file's digest didn't match what was advertised.
    IntegrityFailure,
    /// The tracker's active peer set is at `peer_limit`.
    AdmissionDenied,
    /// The requested username is already registered from a different
    /// address.
    DuplicateName,
    /// A fatal failure to reach the tracker (e.g. a failed `KEEP_ALIVE`).
    TrackerUnreachable,
    /// The download completed but fewer chunks were assembled than the
    /// advertised chunk count.
    Incomplete,
    /// No seeder remained in the filtered candidate set (self-exclusion or
    /// an empty `GET_PEERS` response).
    NoSeeders,
    /// No seeder answered `REQUEST_METADATA`.
    NoMetadata,
    /// Underlying I/O failure.
    Io(io::Error),
    /// JSON (de)serialization failure.
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Unavailable => write!(f, "seeder unavailable"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::ProtocolViolation(msg) => {
                write!(f, "protocol violation: {}", msg)
            }
            Error::IntegrityFailure => write!(f, "digest mismatch"),
            Error::AdmissionDenied => write!(f, "peer limit reached"),
            Error::DuplicateName => {
                write!(f, "username already registered")
            }
            Error::TrackerUnreachable => write!(f, "tracker unreachable"),
            Error::Incomplete => write!(f, "download incomplete"),
            Error::NoSeeders => write!(f, "no seeders available"),
            Error::NoMetadata => write!(f, "no seeder served metadata"),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}
