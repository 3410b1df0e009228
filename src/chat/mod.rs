//! Chat rooms: the message buffer of each room, the seams it talks to (listener, local store,
//!  payload filter), and the shard connections that carry the rooms' commands.

pub mod buffer;
pub mod filter;
pub mod listener;
pub mod message;
pub mod shard;
pub mod storage;
