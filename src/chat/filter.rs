use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};

use crate::chat::message::Message;
use crate::util::id::Id;

/// Transforms message payloads on their way to and from the server, e.g. for end-to-end
///  encryption. Edit references travel inside the payload, so the filter is where they are
///  encoded and recovered.
pub trait MessageFilter {
    fn encrypt(&self, msg: &Message) -> anyhow::Result<Bytes>;

    /// Replaces the received payload with the plain one, setting `edits` if the message is
    ///  an edit
    fn decrypt(&self, msg: &mut Message) -> anyhow::Result<()>;
}

const EDIT_PREFIX: &[u8] = b"e:";

/// No encryption, an edit reference is sent as an `e:<id>\n` prefix
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainFilter;

impl MessageFilter for PlainFilter {
    fn encrypt(&self, msg: &Message) -> anyhow::Result<Bytes> {
        if !msg.is_edit() {
            return Ok(msg.payload.clone());
        }
        if msg.edits_is_xid() {
            return Err(anyhow!("can't send an edit of unconfirmed message {}", msg.edits));
        }

        let edits = msg.edits.to_base64();
        let mut buf = BytesMut::with_capacity(EDIT_PREFIX.len() + edits.len() + 1 + msg.payload.len());
        buf.put_slice(EDIT_PREFIX);
        buf.put_slice(edits.as_bytes());
        buf.put_u8(b'\n');
        buf.put_slice(&msg.payload);
        Ok(buf.freeze())
    }

    fn decrypt(&self, msg: &mut Message) -> anyhow::Result<()> {
        if !msg.payload.starts_with(EDIT_PREFIX) {
            return Ok(());
        }
        let Some(eol) = msg.payload.iter().position(|&b| b == b'\n') else {
            return Err(anyhow!("unterminated edit reference"));
        };

        let edits = std::str::from_utf8(&msg.payload[EDIT_PREFIX.len()..eol])?;
        let edits = Id::from_base64(edits)?;
        msg.set_edits(edits, false);
        msg.payload = msg.payload.slice(eol + 1..);
        Ok(())
    }
}
