use crate::device::pid::Pid;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum TokenType {
    Setup,
    Out,
    In,
}

impl TokenType {
    pub fn pid(self) -> Pid {
        match self {
            TokenType::Setup => Pid::Setup,
            TokenType::Out => Pid::Out,
            TokenType::In => Pid::In,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token {
    pub token_type: TokenType,
    pub address: u8,
    pub endpoint: u8,
}

impl Token {
    /// Address and endpoint fields followed by their CRC5, as sent on the wire.
    pub fn fields(&self) -> [u8; 2] {
        let field = u16::from(self.address & 0x7F) | (u16::from(self.endpoint & 0xF) << 7);
        with_crc5(field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataPID {
    Data0,
    Data1,
}

impl DataPID {
    pub fn pid(self) -> Pid {
        match self {
            DataPID::Data0 => Pid::Data0,
            DataPID::Data1 => Pid::Data1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub pid: DataPID,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandShake {
    Ack,
    NAck,
    Stall,
}

impl HandShake {
    pub fn pid(self) -> Pid {
        match self {
            HandShake::Ack => Pid::Ack,
            HandShake::NAck => Pid::Nak,
            HandShake::Stall => Pid::Stall,
        }
    }
}

/// Appends the CRC5 of an 11 bit field, msb of the CRC sent first.
pub fn with_crc5(field: u16) -> [u8; 2] {
    let field = field & 0x7FF;
    let mut acc = 0x1Fu8;
    for i in 0..11 {
        let do_xor = ((field >> i) & 1) as u8 != ((acc >> 4) & 1);
        acc = (acc << 1) & 0x1F;
        if do_xor {
            acc ^= 5;
        }
    }
    let crc = !acc & 0x1F;
    (field | (u16::from(crc.reverse_bits() >> 3) << 11)).to_le_bytes()
}

pub fn crc5(v: &[u8]) -> u8 {
    let mut acc = 0x1F;
    for b in v {
        let mut b = *b;
        for _ in 0..8 {
            let do_xor = (b & 1) != ((acc >> 4) & 1);
            acc <<= 1;
            if do_xor {
                acc ^= 5
            }
            acc &= 0x1F;
            b >>= 1;
        }
    }
    acc
}

pub fn crc16(v: &[u8]) -> u16 {
    let mut acc = 0xFFFF;
    for b in v {
        let mut b = *b;
        for _ in 0..8 {
            let do_xor = (b as u16 & 1) != ((acc >> 15) & 1);
            acc <<= 1;
            if do_xor {
                acc ^= 0x8005
            }
            b >>= 1;
        }
    }
    acc
}

/// CRC16 bytes closing a DATA packet carrying `payload`.
pub fn crc16_bytes(payload: &[u8]) -> [u8; 2] {
    (!crc16(payload).reverse_bits()).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_fields_carry_crc5() {
        let token = |address, endpoint| {
            Token {
                token_type: TokenType::Setup,
                address,
                endpoint,
            }
            .fields()
        };
        assert_eq!(token(0, 0), [0x00, 0x10]);
        assert_eq!(token(5, 0), [0x05, 0xD0]);
        assert_eq!(token(6, 0), [0x06, 0x90]);
        assert_eq!(token(5, 1), [0x85, 0x60]);
        assert_eq!(token(5, 2), [0x05, 0xF9]);
        assert_eq!(token(0x3A, 0xA), [0x3A, 0x3D]);
        assert_eq!(crc5(&token(27, 0)), 0b01100);
    }

    #[test]
    fn data_crc_known_answer() {
        assert_eq!(crc16_bytes(&[0, 1, 2, 3]), [0xEF, 0x7A]);
        assert_eq!(crc16_bytes(&[]), [0x00, 0x00]);
        assert_eq!(crc16(&[0, 1, 2, 3, 0xEF, 0x7A]), 0x800D);
    }
}
