use std::fmt::{Debug, Display};
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FramingError;

/// Untyped wire unit: one opcode byte followed by an opcode-specific payload. Several commands
///  are concatenated into one transport frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub payload: Bytes,
}

impl Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Command{{op:{}, {} bytes}}", self.opcode, self.payload.len())
    }
}

impl Command {
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Command {
        Command {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.opcode);
        buf.put_slice(&self.payload);
    }

    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Short human readable summary for logging, based on the typed command if the opcode is
    ///  known to protocol `C`
    pub fn describe<C: ProtocolCommand>(&self) -> String {
        let mut payload: &[u8] = &self.payload;
        match C::deser(self.opcode, &mut payload) {
            Ok(typed) => typed.to_string(),
            Err(_) => format!("opcode {} ({} payload bytes)", self.opcode, self.payload.len()),
        }
    }
}

/// A typed command set of one protocol (chat rooms, presence)
pub trait ProtocolCommand: Sized + Debug + Display {
    fn opcode(&self) -> u8;

    fn ser_payload(&self, buf: &mut BytesMut);

    /// Decodes the payload of a command whose opcode byte was already consumed. Implementations
    ///  advance `buf` by exactly the number of bytes they consume.
    fn deser(opcode: u8, buf: &mut &[u8]) -> Result<Self, FramingError>;

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.opcode());
        self.ser_payload(buf);
    }

    fn to_command(&self) -> Command {
        let mut payload = BytesMut::new();
        self.ser_payload(&mut payload);
        Command::new(self.opcode(), payload.freeze())
    }
}

/// Iterates the commands in an inbound frame.
///
/// The opcode byte is consumed before the command's decoder runs, so a failing decoder can never
///  cause the same command to be decoded again. The first framing error is yielded and ends the
///  iteration: everything after it in the frame is dropped.
pub struct CommandDecoder<'a, C: ProtocolCommand> {
    buf: &'a [u8],
    failed: bool,
    _protocol: PhantomData<C>,
}

impl<'a, C: ProtocolCommand> CommandDecoder<'a, C> {
    pub fn new(frame: &'a [u8]) -> CommandDecoder<'a, C> {
        CommandDecoder {
            buf: frame,
            failed: false,
            _protocol: PhantomData,
        }
    }

    /// number of bytes that were not consumed (yet)
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

impl<C: ProtocolCommand> Iterator for CommandDecoder<'_, C> {
    type Item = Result<C, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || !self.buf.has_remaining() {
            return None;
        }

        let opcode = self.buf.get_u8();
        let result = C::deser(opcode, &mut self.buf);
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

/// Splits a frame into untyped commands. Payload lengths are opcode specific, so protocol `C`
///  is needed to find the command boundaries.
pub fn decode_commands<C: ProtocolCommand>(frame: &[u8]) -> Result<Vec<Command>, FramingError> {
    let mut result = Vec::new();
    let mut buf = frame;
    while buf.has_remaining() {
        let opcode = buf.get_u8();
        let before = buf;
        C::deser(opcode, &mut buf)?;
        let consumed = before.len() - buf.len();
        result.push(Command::new(opcode, Bytes::copy_from_slice(&before[..consumed])));
    }
    Ok(result)
}
