use byteorder::{BigEndian, ByteOrder as _};

use crate::{PduError, PduResult};

/// TPKT header
///
/// TPKTs are defined in:
///
/// - <https://www.rfc-editor.org/rfc/rfc1006> — RFC 1006 - ISO Transport Service on top of the TCP
/// - <http://www.itu.int/rec/T-REC-T.123/> — ITU-T T.123 (01/2007) - Network-specific data protocol
///   stacks for multimedia conferencing
///
/// ```diagram
///       TPKT Header
///  ____________________   byte
/// |                    |
/// |     3 (version)    |   1
/// |____________________|
/// |                    |
/// |      Reserved      |   2
/// |____________________|
/// |                    |
/// |    Length (MSB)    |   3
/// |____________________|
/// |                    |
/// |    Length (LSB)    |   4
/// |____________________|
/// ```
///
/// The length field counts the entire packet, header included, so a TPKT
/// whose length field reads 4 carries an empty payload.
#[derive(PartialEq, Eq, Debug)]
pub struct TpktHeader {
    pub packet_length: u16,
}

impl TpktHeader {
    pub const VERSION: u8 = 3;

    pub const SIZE: usize = 4;

    pub const NAME: &'static str = "TpktHeader";

    pub fn read(src: &[u8]) -> PduResult<Self> {
        if src.len() < Self::SIZE {
            return Err(PduError::NotEnoughBytes {
                received: src.len(),
                expected: Self::SIZE,
            });
        }

        let version = src[0];

        if version != Self::VERSION {
            return Err(PduError::UnsupportedVersion { got: version });
        }

        let packet_length = BigEndian::read_u16(&src[2..4]);

        Ok(Self { packet_length })
    }

    pub fn write(&self, dst: &mut [u8]) -> PduResult<()> {
        if dst.len() < Self::SIZE {
            return Err(PduError::NotEnoughBytes {
                received: dst.len(),
                expected: Self::SIZE,
            });
        }

        dst[0] = Self::VERSION;
        dst[1] = 0;
        BigEndian::write_u16(&mut dst[2..4], self.packet_length);

        Ok(())
    }

    pub fn packet_length(&self) -> usize {
        usize::from(self.packet_length)
    }
}
