use crate::slice_utils::write_to_offset_unchecked;
use etherparse::UdpHeaderSlice;

pub struct UdpHeaderSliceMut<'a> {
    slice: &'a mut [u8],
}

impl<'a> UdpHeaderSliceMut<'a> {
    /// Creates a new [`UdpHeaderSliceMut`].
    ///
    /// # Safety
    ///
    /// The byte slice must contain a valid Udp header.
    pub unsafe fn from_slice_unchecked(slice: &'a mut [u8]) -> Self {
        debug_assert!(UdpHeaderSlice::from_slice(slice).is_ok());

        Self { slice }
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        // Safety: Slice it at least of length 8 as checked in the ctor.
        unsafe { write_to_offset_unchecked(self.slice, 6, checksum.to_be_bytes()) };
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
            .udp(10, 20)
            .write(&mut buf, &[])
            .unwrap();

        let mut slice = unsafe { UdpHeaderSliceMut::from_slice_unchecked(&mut buf[20..]) };
        slice.set_checksum(60);

        let slice = UdpHeaderSlice::from_slice(&buf[20..]).unwrap();
        assert_eq!(slice.checksum(), 60);
    }
}
