//! Binary command codec. Frames are a sequence of commands, each an opcode byte followed by
//!  an opcode-specific payload of little-endian integers, raw 8 byte ids and length-prefixed
//!  blobs.

pub mod command;
pub mod chat_commands;
pub mod presence_commands;
