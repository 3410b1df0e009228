use bytes::{Buf, BufMut, Bytes};

use crate::error::FramingError;
use crate::util::id::Id;

// Bounds-checked reads for command decoding. An out-of-range read is reported as
//  `FramingError::Truncated` carrying the opcode name, so that it is distinguishable from an
//  unknown opcode in the logs.

macro_rules! read_checked_impl {
    ($reader: ident, $ty:ty, $getter: ident) => {
        fn $reader(&mut self, opcode: &'static str) -> Result<$ty, FramingError> {
            self.ensure_remaining(opcode, size_of::<$ty>())?;
            Ok(self.$getter())
        }
    }
}

pub trait BufExt: Buf {
    fn ensure_remaining(&self, opcode: &'static str, needed: usize) -> Result<(), FramingError> {
        if self.remaining() < needed {
            return Err(FramingError::Truncated {
                opcode,
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    read_checked_impl!(read_u8, u8, get_u8);
    read_checked_impl!(read_i8, i8, get_i8);
    read_checked_impl!(read_u16_le, u16, get_u16_le);
    read_checked_impl!(read_u32_le, u32, get_u32_le);
    read_checked_impl!(read_i32_le, i32, get_i32_le);

    fn read_id(&mut self, opcode: &'static str) -> Result<Id, FramingError> {
        self.ensure_remaining(opcode, size_of::<u64>())?;
        Ok(Id::new(self.get_u64_le()))
    }

    /// u32 length prefix followed by that many bytes
    fn read_blob(&mut self, opcode: &'static str) -> Result<Bytes, FramingError> {
        let len = self.read_u32_le(opcode)? as usize;
        self.ensure_remaining(opcode, len)?;
        Ok(self.copy_to_bytes(len))
    }
}

pub trait BufMutExt: BufMut {
    fn put_id(&mut self, id: Id) {
        self.put_u64_le(id.val());
    }

    fn put_blob(&mut self, data: &[u8]) {
        self.put_u32_le(data.len().try_into().expect("blobs are limited to u32::MAX bytes by the wire format"));
        self.put_slice(data);
    }
}

impl<T: Buf + ?Sized> BufExt for T {
}

impl<T: BufMut + ?Sized> BufMutExt for T {
}
