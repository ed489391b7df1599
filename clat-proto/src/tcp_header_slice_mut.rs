use crate::slice_utils::write_to_offset_unchecked;
use etherparse::TcpHeaderSlice;

/// Writer for the one TCP field the translator ever touches: the checksum.
/// Addresses and ports never move within the TCP segment itself during
/// translation, so there is nothing else to rewrite here.
pub struct TcpHeaderSliceMut<'a> {
    slice: &'a mut [u8],
}

impl<'a> TcpHeaderSliceMut<'a> {
    /// Creates a new [`TcpHeaderSliceMut`].
    ///
    /// # Safety
    ///
    /// The byte slice must contain a valid Tcp header.
    pub unsafe fn from_slice_unchecked(slice: &'a mut [u8]) -> Self {
        debug_assert!(TcpHeaderSlice::from_slice(slice).is_ok());

        Self { slice }
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        // Safety: Slice is at least of length 20 as checked in the ctor.
        unsafe { write_to_offset_unchecked(self.slice, 16, checksum.to_be_bytes()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn smoke() {
        let mut buf = Vec::new();

        PacketBuilder::ipv4([0u8; 4], [0u8; 4], 0)
            .tcp(10, 20, 0, 1000)
            .write(&mut buf, &[])
            .unwrap();

        let mut slice = unsafe { TcpHeaderSliceMut::from_slice_unchecked(&mut buf[20..]) };
        slice.set_checksum(60);

        let slice = TcpHeaderSlice::from_slice(&buf[20..]).unwrap();
        assert_eq!(slice.checksum(), 60);
    }
}
