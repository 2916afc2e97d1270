use std::fmt;

/// Packet identifiers handled by the device. On the wire the 4 bit code is followed by its
/// complement, `Pid::byte` gives the full 8 bit value sent lsb first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Out = 0b0001,
    In = 0b1001,
    Sof = 0b0101,
    Setup = 0b1101,
    Data0 = 0b0011,
    Data1 = 0b1011,
    Ack = 0b0010,
    Nak = 0b1010,
    Stall = 0b1110,
}

impl Pid {
    pub fn nibble(self) -> u8 {
        self as u8
    }

    pub fn byte(self) -> u8 {
        let n = self.nibble();
        (!n << 4) | n
    }

    pub fn from_nibble(nibble: u8) -> Option<Self> {
        Some(match nibble {
            0b0001 => Pid::Out,
            0b1001 => Pid::In,
            0b0101 => Pid::Sof,
            0b1101 => Pid::Setup,
            0b0011 => Pid::Data0,
            0b1011 => Pid::Data1,
            0b0010 => Pid::Ack,
            0b1010 => Pid::Nak,
            0b1110 => Pid::Stall,
            _ => return None,
        })
    }

    /// Rejects unknown codes and bytes whose check nibble is not the complement.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_nibble(byte & 0xF).filter(|pid| pid.byte() == byte)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Pid::Out => "OUT",
            Pid::In => "IN",
            Pid::Sof => "SOF",
            Pid::Setup => "SETUP",
            Pid::Data0 => "DATA0",
            Pid::Data1 => "DATA1",
            Pid::Ack => "ACK",
            Pid::Nak => "NAK",
            Pid::Stall => "STALL",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_bytes() {
        assert_eq!(Pid::Out.byte(), 0xE1);
        assert_eq!(Pid::In.byte(), 0x69);
        assert_eq!(Pid::Sof.byte(), 0xA5);
        assert_eq!(Pid::Setup.byte(), 0x2D);
        assert_eq!(Pid::Data0.byte(), 0xC3);
        assert_eq!(Pid::Data1.byte(), 0x4B);
        assert_eq!(Pid::Ack.byte(), 0xD2);
        assert_eq!(Pid::Nak.byte(), 0x5A);
        assert_eq!(Pid::Stall.byte(), 0x1E);
    }

    #[test]
    fn check_nibble_is_enforced() {
        assert_eq!(Pid::from_byte(0xD2), Some(Pid::Ack));
        assert_eq!(Pid::from_byte(0x02), None);
        assert_eq!(Pid::from_byte(0x96), None); // NYET is not handled
        assert_eq!(Pid::from_byte(0x00), None);
    }
}
