use bytes::Buf;

use crate::error::PacketError;

/// Length-prefixed reads on top of the `try_get_*` family of [`Buf`].
pub trait WireBufExt: Buf {
    /// Copies out `len` bytes, or fails with [`PacketError::Truncated`]
    /// without consuming anything.
    fn try_get_bytes(&mut self, len: usize) -> Result<Vec<u8>, PacketError> {
        let mut out = vec![0u8; len];
        self.try_copy_to_slice(&mut out)?;
        Ok(out)
    }
}

impl<B: Buf + ?Sized> WireBufExt for B {}
