//! The presence protocol: a connection of its own to the presence server, carrying the user's
//!  presence settings, user activity and the online status of the peers the user is interested in.

pub mod client;
pub mod config;
