//! Endpoint buffer RAM and firmware ROM.

use std::io::Read;
use std::path::Path;

use anyhow::Context;

/// Rows of the 1 KiB endpoint RAM, each holding one byte per lane.
pub const RAM_ROWS: usize = 256;

/// One cycle of access to the RAM port. `wstrb` has one bit per byte lane.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RamPort {
    pub row: u8,
    pub wstrb: u8,
    pub wdata: u32,
}

impl RamPort {
    /// Byte access from the engine's 10 bit address: the byte is replicated on every lane and only
    /// its own lane is strobed.
    pub fn byte(addr: u16, wen: bool, wdata: u8) -> Self {
        let lane = addr & 0x3;
        Self {
            row: ((addr >> 2) & 0xFF) as u8,
            wstrb: if wen { 1 << lane } else { 0 },
            wdata: u32::from_le_bytes([wdata; 4]),
        }
    }
}

/// Four byte lanes of 256 bytes, synchronous read: `rdata` holds the row addressed on the
/// previous access.
#[derive(Debug, Clone)]
pub struct EndpointRam {
    rows: Vec<u32>,
    rdata: u32,
}

impl EndpointRam {
    pub fn new() -> Self {
        Self {
            rows: vec![0; RAM_ROWS],
            rdata: 0,
        }
    }

    pub fn rdata(&self) -> u32 {
        self.rdata
    }

    /// Clock edge. Writes land before the read so a row read and written on the same cycle
    /// returns the new data.
    pub fn next(&mut self, port: Option<RamPort>) {
        let port = match port {
            Some(port) => port,
            None => return,
        };
        let row = &mut self.rows[usize::from(port.row)];
        for lane in 0..4 {
            if port.wstrb & (1 << lane) != 0 {
                let mask = 0xFFu32 << (8 * lane);
                *row = (*row & !mask) | (port.wdata & mask);
            }
        }
        self.rdata = *row;
    }

    /// Debug view of a byte, outside of any port.
    #[cfg(test)]
    pub fn peek(&self, addr: u16) -> u8 {
        let row = self.rows[usize::from((addr >> 2) & 0xFF)];
        (row >> (8 * (addr & 0x3))) as u8
    }
}

impl Default for EndpointRam {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only word memory, little endian image. Reads past the image return 0.
#[derive(Debug, Clone, Default)]
pub struct Rom {
    words: Vec<u32>,
}

impl Rom {
    pub fn from_bytes(image: &[u8]) -> Self {
        Self {
            words: image
                .chunks(4)
                .map(|chunk| {
                    let mut word = [0; 4];
                    word[..chunk.len()].copy_from_slice(chunk);
                    u32::from_le_bytes(word)
                })
                .collect(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut image = Vec::new();
        std::fs::File::open(path)
            .and_then(|mut file| file.read_to_end(&mut image))
            .with_context(|| format!("Loading ROM image {}", path.display()))?;
        Ok(Self::from_bytes(&image))
    }

    pub fn word(&self, index: u32) -> u32 {
        self.words.get(index as usize).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_lanes() {
        let mut ram = EndpointRam::new();
        ram.next(Some(RamPort::byte(8, true, 0x23)));
        ram.next(Some(RamPort::byte(9, true, 0x64)));
        ram.next(Some(RamPort::byte(10, true, 0x54)));
        assert_eq!(ram.rdata(), 0x0054_6423);
        assert_eq!(ram.peek(9), 0x64);
        assert_eq!(ram.peek(11), 0x00);
    }

    #[test]
    fn read_is_registered() {
        let mut ram = EndpointRam::new();
        ram.next(Some(RamPort {
            row: 36,
            wstrb: 0xF,
            wdata: 0xCAFE_D00D,
        }));
        ram.next(Some(RamPort::byte(0, false, 0)));
        assert_eq!(ram.rdata(), 0);
        ram.next(None);
        assert_eq!(ram.rdata(), 0);
        ram.next(Some(RamPort::byte(144 + 2, false, 0)));
        assert_eq!(ram.rdata(), 0xCAFE_D00D);
    }

    #[test]
    fn rom_pads_with_zero() {
        let rom = Rom::from_bytes(&[0x13, 0x00, 0x00, 0x00, 0xAA]);
        assert_eq!(rom.word(0), 0x13);
        assert_eq!(rom.word(1), 0xAA);
        assert_eq!(rom.word(100), 0);
    }
}
