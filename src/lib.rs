//! chunkmesh: a peer-to-peer chunked file distribution engine.
//!
//! A centralized [`tracker`] maintains peer membership and a file-to-seeder
//! index over UDP; a symmetric peer chunks the files in a shared directory,
//! announces them, and performs parallel integrity-checked downloads from
//! other peers over TCP while simultaneously serving chunks to others.
//! [`engine::Peer`] is the facade most callers want; the other modules are
//! its parts, exposed for anyone assembling a custom peer.

#[macro_use]
extern crate serde_derive;

pub mod chunk;
pub mod conf;
pub mod engine;
pub mod error;
pub mod peer;
pub mod store;
pub mod tracker;
