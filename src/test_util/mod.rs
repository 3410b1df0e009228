//! Test doubles for the seams of the client: transports, listeners, the local store and the
//!  command sink of a room's buffer.

pub mod command_sink;
pub mod listener;
pub mod storage;
pub mod transport;
