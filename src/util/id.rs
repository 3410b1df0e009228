use std::fmt::{Debug, Display, Formatter};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Opaque 64 bit handle used for users, rooms, messages and transaction ids.
///
/// The wire format is always the raw 8 bytes; the base64url form is for logging and
///  diagnostics only.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    pub const NULL: Id = Id(0);

    pub const fn new(val: u64) -> Id {
        Id(val)
    }

    pub fn val(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.to_le_bytes())
    }

    pub fn from_base64(s: &str) -> anyhow::Result<Id> {
        let raw = URL_SAFE_NO_PAD.decode(s.trim_end_matches('='))?;
        let bytes: [u8; 8] = raw.as_slice().try_into()
            .map_err(|_| anyhow::anyhow!("an id has 8 bytes, was {}", raw.len()))?;
        Ok(Id(u64::from_le_bytes(bytes)))
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id(value)
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({})", self.to_base64())
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}
