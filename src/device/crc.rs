//! Serial CRC engines, one data bit per enabled cycle.
//!
//! Both registers are seeded with all ones. Once a packet's payload and its transmitted CRC have
//! been shifted in, the register holds a fixed residual when the packet is intact.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crc5(u8);

impl Crc5 {
    pub const SEED: u8 = 0x1F;
    pub const RESIDUAL: u8 = 0b01100;

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn is_residual(&self) -> bool {
        self.0 == Self::RESIDUAL
    }

    /// x^5 + x^2 + 1
    fn shifted(&self, data: bool) -> u8 {
        let q = self.0;
        let fb = ((q >> 4) & 1) ^ data as u8;
        ((q << 1) & 0x1E ^ (fb << 2)) | fb
    }

    pub fn next(&self, data: bool, enable: bool, reset: bool) -> Self {
        if reset {
            Self::default()
        } else if enable {
            Self(self.shifted(data))
        } else {
            *self
        }
    }
}

impl Default for Crc5 {
    fn default() -> Self {
        Self(Self::SEED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crc16(u16);

impl Crc16 {
    pub const SEED: u16 = 0xFFFF;
    pub const RESIDUAL: u16 = 0x800D;

    pub fn value(&self) -> u16 {
        self.0
    }

    pub fn is_residual(&self) -> bool {
        self.0 == Self::RESIDUAL
    }

    /// CRC as it goes on the wire: bit reversed and inverted, low byte sent first.
    pub fn tx_value(&self) -> u16 {
        !self.0.reverse_bits()
    }

    /// x^16 + x^15 + x^2 + 1
    fn shifted(&self, data: bool) -> u16 {
        let q = self.0;
        let fb = ((q >> 15) & 1) ^ data as u16;
        let mut c = (q << 1) & 0x7FFA;
        c |= fb;
        c |= (((q >> 1) & 1) ^ fb) << 2;
        c |= (((q >> 14) & 1) ^ fb) << 15;
        c
    }

    pub fn next(&self, data: bool, enable: bool, reset: bool) -> Self {
        if reset {
            Self::default()
        } else if enable {
            Self(self.shifted(data))
        } else {
            *self
        }
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self(Self::SEED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::types::{crc16, crc5};

    fn feed5(bytes: &[u8], bits: usize) -> Crc5 {
        (0..bits).fold(Crc5::default(), |crc, i| {
            crc.next((bytes[i / 8] >> (i % 8)) & 1 == 1, true, false)
        })
    }

    fn feed16(bytes: &[u8]) -> Crc16 {
        bytes.iter().fold(Crc16::default(), |crc, b| {
            (0..8).fold(crc, |crc, i| crc.next((b >> i) & 1 == 1, true, false))
        })
    }

    #[test]
    fn setup_token_leaves_crc5_residual() {
        // SETUP to address 0 endpoint 0, CRC5 = 0b00010 sent msb first.
        assert!(feed5(&[0x00, 0x10], 16).is_residual());
        // IN to address 0x3A endpoint 0xA.
        assert!(feed5(&[0x3A, 0x3D], 16).is_residual());
        assert!(!feed5(&[0x3B, 0x3D], 16).is_residual());
    }

    #[test]
    fn serial_crc5_matches_bytewise_reference() {
        for addr in 0..128u8 {
            let bytes = [addr | 0x80, 0x5C];
            assert_eq!(feed5(&bytes, 16).value(), crc5(&bytes));
        }
    }

    #[test]
    fn data_packet_leaves_crc16_residual() {
        // DATA0 with payload 00 01 02 03 carries CRC 0xEF 0x7A.
        assert!(feed16(&[0x00, 0x01, 0x02, 0x03, 0xEF, 0x7A]).is_residual());
        assert!(!feed16(&[0x00, 0x01, 0x02, 0x03, 0xEF, 0x7B]).is_residual());
        // empty payload sends 0x0000
        assert!(feed16(&[0x00, 0x00]).is_residual());
    }

    #[test]
    fn transmitted_crc16_closes_the_packet() {
        let payload = [0x23, 0x64, 0x54, 0xAF, 0xCA, 0xFE];
        let tx = feed16(&payload).tx_value();
        let mut packet = payload.to_vec();
        packet.extend_from_slice(&tx.to_le_bytes());
        assert!(feed16(&packet).is_residual());
        assert_eq!(feed16(&packet).value(), crc16(&packet));
        assert_eq!(Crc16::default().tx_value(), 0x0000);
    }

    #[test]
    fn reset_wins_over_enable() {
        let crc = feed16(&[0x12, 0x34]);
        assert_eq!(crc.next(true, true, true), Crc16::default());
        assert_eq!(crc.next(true, false, false), crc);
        let crc = feed5(&[0x12], 8);
        assert_eq!(crc.next(false, true, true), Crc5::default());
    }
}
