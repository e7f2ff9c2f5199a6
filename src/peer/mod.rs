//! Everything peer-side: the advisory seeder availability map, the
//! downloader, the request codec, the long-running lifecycle tasks, the TCP
//! serving side, and the tracker protocol client they share.

pub mod availability;
pub mod client;
pub mod codec;
pub mod lifecycle;
pub mod server;
pub mod tracker_client;
