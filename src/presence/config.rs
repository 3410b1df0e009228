use std::fmt::{Display, Formatter};
use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Presence {
    Offline = 0,
    Away = 1,
    Online = 2,
    Busy = 3,
}

const MASK_PRESENCE: u16 = 0b0011;
const FLAG_PERSIST: u16 = 0b0100;
/// inverted on the wire: set means auto-away is *off*
const FLAG_AUTOAWAY_DISABLED: u16 = 0b1000;
const SHIFT_TIMEOUT: u16 = 4;
const MAX_TIMEOUT_CODE: u32 = (u16::MAX >> SHIFT_TIMEOUT) as u32;

/// Timeouts up to this many seconds are encoded exactly, longer ones in minute granularity
const EXACT_TIMEOUT_LIMIT: u32 = 600;

/// The user's presence settings, shared by all of the user's sessions through the server.
///
/// Wire format is a 16 bit code: bits 0-1 presence, bit 2 persist, bit 3 auto-away *disabled*,
///  bits 4-15 auto-away timeout in seconds. Timeouts above ten minutes are stored as
///  `600 + minutes above ten minutes`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    pub presence: Presence,
    /// keep the presence even if no client of the user is connected
    pub persist: bool,
    pub autoaway_active: bool,
    pub autoaway_timeout_secs: u32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        PresenceConfig {
            presence: Presence::Online,
            persist: false,
            autoaway_active: true,
            autoaway_timeout_secs: 600,
        }
    }
}

impl PresenceConfig {
    pub fn from_code(code: u16) -> PresenceConfig {
        let presence = Presence::try_from((code & MASK_PRESENCE) as u8)
            .expect("two bits always map to a presence value");
        let mut autoaway_timeout_secs = (code >> SHIFT_TIMEOUT) as u32;
        if autoaway_timeout_secs > EXACT_TIMEOUT_LIMIT {
            autoaway_timeout_secs = EXACT_TIMEOUT_LIMIT + (autoaway_timeout_secs - EXACT_TIMEOUT_LIMIT) * 60;
        }

        PresenceConfig {
            presence,
            persist: code & FLAG_PERSIST != 0,
            autoaway_active: code & FLAG_AUTOAWAY_DISABLED == 0,
            autoaway_timeout_secs,
        }
    }

    pub fn to_code(&self) -> u16 {
        let timeout = if self.autoaway_timeout_secs > EXACT_TIMEOUT_LIMIT {
            EXACT_TIMEOUT_LIMIT + (self.autoaway_timeout_secs - EXACT_TIMEOUT_LIMIT) / 60
        }
        else {
            self.autoaway_timeout_secs
        };
        let timeout = timeout.min(MAX_TIMEOUT_CODE) as u16;

        (u8::from(self.presence) as u16 & MASK_PRESENCE)
            | (if self.persist { FLAG_PERSIST } else { 0 })
            | (if self.autoaway_active { 0 } else { FLAG_AUTOAWAY_DISABLED })
            | (timeout << SHIFT_TIMEOUT)
    }

    pub fn autoaway_timeout(&self) -> Duration {
        Duration::from_secs(self.autoaway_timeout_secs as u64)
    }

    /// Auto-away applies only if it is enabled, the presence is not persisted and the user is
    ///  currently 'present' in some way
    pub fn autoaway_in_effect(&self) -> bool {
        self.autoaway_active
            && !self.persist
            && self.autoaway_timeout_secs > 0
            && self.presence != Presence::Offline
            && self.presence != Presence::Away
    }
}

impl Display for PresenceConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "pres: {:?}, persist: {}, aaActive: {}, aaTimeout: {}",
            self.presence,
            self.persist as u8,
            self.autoaway_active as u8,
            self.autoaway_timeout_secs,
        )
    }
}
