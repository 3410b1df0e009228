use std::fmt::{Display, Formatter};

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};

use crate::error::FramingError;
use crate::presence::config::{Presence, PresenceConfig};
use crate::protocol::command::ProtocolCommand;
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::id::Id;

pub const PRESENCE_PROTOCOL_VERSION: u8 = 1;

const ID_KEEPALIVE: u8 = 0;
const ID_HELLO: u8 = 1;
const ID_STATUSOVERRIDE: u8 = 2;
const ID_USERACTIVE: u8 = 3;
const ID_ADDPEERS: u8 = 4;
const ID_DELPEERS: u8 = 5;
const ID_PEERSTATUS: u8 = 6;
const ID_PREFS: u8 = 7;

bitflags! {
    /// Client capabilities announced in HELLO
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct Capabilities: u8 {
        const WEBRTC = 0b1000_0000;
        const MOBILE = 0b0100_0000;
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum PresenceCommand {
    Keepalive,
    Hello(HelloData),
    /// obsolete, superseded by PREFS; decoded for completeness
    StatusOverride(Presence),
    UserActive(bool),
    AddPeers(Vec<Id>),
    DelPeers(Vec<Id>),
    PeerStatus(PeerStatusData),
    /// packed [`PresenceConfig`] code
    Prefs(u16),
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct HelloData {
    pub version: u8,
    pub capabilities: Capabilities,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct PeerStatusData {
    pub presence: Presence,
    pub user_id: Id,
}

pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        ID_KEEPALIVE => "KEEPALIVE",
        ID_HELLO => "HELLO",
        ID_STATUSOVERRIDE => "STATUSOVERRIDE",
        ID_USERACTIVE => "USERACTIVE",
        ID_ADDPEERS => "ADDPEERS",
        ID_DELPEERS => "DELPEERS",
        ID_PEERSTATUS => "PEERSTATUS",
        ID_PREFS => "PREFS",
        _ => "(invalid opcode)",
    }
}

impl PresenceCommand {
    fn ser_peers(peers: &[Id], buf: &mut BytesMut) {
        buf.put_u32_le(peers.len().try_into().expect("peer list exceeds u32::MAX entries"));
        for peer in peers {
            buf.put_id(*peer);
        }
    }

    fn deser_peers(opcode: &'static str, buf: &mut &[u8]) -> Result<Vec<Id>, FramingError> {
        let count = buf.read_u32_le(opcode)? as usize;
        // checked up front so a bogus count can not trigger a huge allocation
        buf.ensure_remaining(opcode, count.saturating_mul(size_of::<u64>()))?;
        (0..count)
            .map(|_| buf.read_id(opcode))
            .collect()
    }

    fn deser_presence(opcode: &'static str, buf: &mut &[u8]) -> Result<Presence, FramingError> {
        Presence::try_from(buf.read_u8(opcode)?)
            .map_err(|_| FramingError::InvalidValue { opcode, what: "presence" })
    }
}

impl ProtocolCommand for PresenceCommand {
    fn opcode(&self) -> u8 {
        match self {
            PresenceCommand::Keepalive => ID_KEEPALIVE,
            PresenceCommand::Hello(_) => ID_HELLO,
            PresenceCommand::StatusOverride(_) => ID_STATUSOVERRIDE,
            PresenceCommand::UserActive(_) => ID_USERACTIVE,
            PresenceCommand::AddPeers(_) => ID_ADDPEERS,
            PresenceCommand::DelPeers(_) => ID_DELPEERS,
            PresenceCommand::PeerStatus(_) => ID_PEERSTATUS,
            PresenceCommand::Prefs(_) => ID_PREFS,
        }
    }

    fn ser_payload(&self, buf: &mut BytesMut) {
        match self {
            PresenceCommand::Keepalive => {}
            PresenceCommand::Hello(data) => {
                buf.put_u8(data.version);
                buf.put_u8(data.capabilities.bits());
            }
            PresenceCommand::StatusOverride(presence) => buf.put_u8((*presence).into()),
            PresenceCommand::UserActive(active) => buf.put_u8(if *active { 1 } else { 0 }),
            PresenceCommand::AddPeers(peers) | PresenceCommand::DelPeers(peers) => Self::ser_peers(peers, buf),
            PresenceCommand::PeerStatus(data) => {
                buf.put_u8(data.presence.into());
                buf.put_id(data.user_id);
            }
            PresenceCommand::Prefs(code) => buf.put_u16_le(*code),
        }
    }

    fn deser(opcode: u8, buf: &mut &[u8]) -> Result<PresenceCommand, FramingError> {
        let name = opcode_name(opcode);
        let cmd = match opcode {
            ID_KEEPALIVE => PresenceCommand::Keepalive,
            ID_HELLO => {
                let version = buf.read_u8(name)?;
                let capabilities = Capabilities::from_bits_retain(buf.read_u8(name)?);
                PresenceCommand::Hello(HelloData { version, capabilities })
            }
            ID_STATUSOVERRIDE => PresenceCommand::StatusOverride(Self::deser_presence(name, buf)?),
            ID_USERACTIVE => PresenceCommand::UserActive(buf.read_u8(name)? != 0),
            ID_ADDPEERS => PresenceCommand::AddPeers(Self::deser_peers(name, buf)?),
            ID_DELPEERS => PresenceCommand::DelPeers(Self::deser_peers(name, buf)?),
            ID_PEERSTATUS => {
                let presence = Self::deser_presence(name, buf)?;
                let user_id = buf.read_id(name)?;
                PresenceCommand::PeerStatus(PeerStatusData { presence, user_id })
            }
            ID_PREFS => PresenceCommand::Prefs(buf.read_u16_le(name)?),
            other => return Err(FramingError::UnknownOpcode(other)),
        };
        Ok(cmd)
    }
}

impl Display for PresenceCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceCommand::Keepalive => write!(f, "KEEPALIVE"),
            PresenceCommand::Hello(d) => write!(f, "HELLO - version 0x{:02X}, caps: ({},{})",
                d.version,
                if d.capabilities.contains(Capabilities::WEBRTC) { "webrtc" } else { "nowebrtc" },
                if d.capabilities.contains(Capabilities::MOBILE) { "mobile" } else { "desktop" },
            ),
            PresenceCommand::StatusOverride(p) => write!(f, "STATUSOVERRIDE - {:?}", p),
            PresenceCommand::UserActive(active) => write!(f, "USERACTIVE - {}", if *active { 1 } else { 0 }),
            PresenceCommand::AddPeers(peers) => write!(f, "ADDPEERS - {} peers", peers.len()),
            PresenceCommand::DelPeers(peers) => write!(f, "DELPEERS - {} peers", peers.len()),
            PresenceCommand::PeerStatus(d) => write!(f, "PEERSTATUS - user {} with presence {:?}", d.user_id, d.presence),
            PresenceCommand::Prefs(code) => write!(f, "PREFS - {}", PresenceConfig::from_code(*code)),
        }
    }
}
