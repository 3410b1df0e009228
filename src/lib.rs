//! Client side of a sharded chat service: room message buffers with local history, shard
//!  connections with retries and keepalive, and a presence client, all driven by one
//!  single-threaded event loop.

pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod presence;
pub mod promise;
pub mod protocol;
pub mod runtime;
pub mod transport;
pub mod util;

#[cfg(test)]
pub mod test_util;
