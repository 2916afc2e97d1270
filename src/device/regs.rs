//! Control registers shared between the CPU and the protocol engine.
//!
//! | addr | register      | access | layout                                         |
//! |------|---------------|--------|------------------------------------------------|
//! | 0    | ADDR          | rw     | `[6:0]` device address                         |
//! | 1    | ENDP_OWNER    | rw     | `[15:0]` OUT endpoints, `[31:16]` IN endpoints |
//! | 2    | CTRL          | rw     | `[0]` attach (pull-up enable)                  |
//! | 3    | IN_SIZE_0_7   | rw     | 4 bits per endpoint, endpoint `n` at `4n`      |
//! | 4    | IN_SIZE_8_15  | rw     | idem for endpoints 8 to 15                     |
//! | 5    | DATA_TOGGLE   | rw     | same bit layout as ENDP_OWNER                  |
//! | 6    | OUT_SIZE_0_7  | ro     | written by the engine only                     |
//! | 7    | OUT_SIZE_8_15 | ro     | idem                                           |
//!
//! Writing ENDP_OWNER does not overwrite it: the written value is a mask of bits to set. The
//! engine clears bits when it is done with a buffer and a clear wins over a set in the same cycle.

use std::convert::TryFrom;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Addr = 0,
    EndpOwner = 1,
    Ctrl = 2,
    InSize0_7 = 3,
    InSize8_15 = 4,
    DataToggle = 5,
    OutSize0_7 = 6,
    OutSize8_15 = 7,
}

impl TryFrom<u8> for Reg {
    type Error = anyhow::Error;
    fn try_from(addr: u8) -> anyhow::Result<Self> {
        Ok(match addr {
            0 => Reg::Addr,
            1 => Reg::EndpOwner,
            2 => Reg::Ctrl,
            3 => Reg::InSize0_7,
            4 => Reg::InSize8_15,
            5 => Reg::DataToggle,
            6 => Reg::OutSize0_7,
            7 => Reg::OutSize8_15,
            _ => anyhow::bail!("Unmapped register address {}", addr),
        })
    }
}

impl FromStr for Reg {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "ADDR" => Reg::Addr,
            "ENDP_OWNER" => Reg::EndpOwner,
            "CTRL" => Reg::Ctrl,
            "IN_SIZE_0_7" => Reg::InSize0_7,
            "IN_SIZE_8_15" => Reg::InSize8_15,
            "DATA_TOGGLE" => Reg::DataToggle,
            "OUT_SIZE_0_7" => Reg::OutSize0_7,
            "OUT_SIZE_8_15" => Reg::OutSize8_15,
            _ => match s.parse::<u8>() {
                Ok(addr) => Reg::try_from(addr)?,
                Err(_) => anyhow::bail!("Unknown register {:?}", s),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// One half of an endpoint, as addressed by the ownership and toggle bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointId {
    pub direction: Direction,
    pub number: u8,
}

impl EndpointId {
    pub fn new(direction: Direction, number: u8) -> Self {
        debug_assert!(number < 16);
        Self {
            direction,
            number: number & 0xF,
        }
    }

    /// Bit index: OUT endpoints 0-15, IN endpoints 16-31.
    pub fn index(&self) -> u32 {
        let base = match self.direction {
            Direction::Out => 0,
            Direction::In => 16,
        };
        base + u32::from(self.number)
    }

    pub fn mask(&self) -> u32 {
        1 << self.index()
    }

    pub fn is_set(&self, bitmap: u32) -> bool {
        bitmap & self.mask() != 0
    }

    /// Byte address of `offset` inside this endpoint's 8 byte buffer.
    pub fn buffer_addr(&self, offset: u8) -> u16 {
        let dir = match self.direction {
            Direction::Out => 0,
            Direction::In => 1,
        };
        u16::from(offset & 0x7) | (u16::from(self.number) << 3) | (dir << 7)
    }
}

/// Clear (engine) has priority over set (CPU). They should never overlap unless software makes a
/// mistake.
pub fn owner_combine(old: u32, set_mask: u32, clr_mask: u32) -> u32 {
    (old | set_mask) & !clr_mask
}

/// Sixteen 4 bit byte counts packed in 64 bits, endpoint `n` at bits `[4n+3:4n]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeTable(pub u64);

impl SizeTable {
    pub fn get(&self, endpoint: u8) -> u8 {
        ((self.0 >> (4 * u32::from(endpoint & 0xF))) & 0xF) as u8
    }

    pub fn with(self, endpoint: u8, size: u8) -> Self {
        let shift = 4 * u32::from(endpoint & 0xF);
        Self((self.0 & !(0xF << shift)) | (u64::from(size & 0xF) << shift))
    }

    /// Endpoints 0-7 (`high == false`) or 8-15.
    pub fn word(&self, high: bool) -> u32 {
        if high {
            (self.0 >> 32) as u32
        } else {
            self.0 as u32
        }
    }

    pub fn with_word(self, high: bool, value: u32) -> Self {
        if high {
            Self((self.0 & 0xFFFF_FFFF) | (u64::from(value) << 32))
        } else {
            Self((self.0 & !0xFFFF_FFFF) | u64::from(value))
        }
    }
}

/// CPU side of the register file for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegBus {
    pub wen: bool,
    pub ren: bool,
    pub addr: u8,
    pub wdata: u32,
}

/// Engine side updates for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineUpdate {
    /// Registered clear request, applied through [`owner_combine`].
    pub owner_clr: u32,
    /// `(endpoint, size)` of a completed OUT transfer.
    pub out_size: Option<(u8, u8)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegisterFile {
    pub addr: u8,
    pub endp_owner: u32,
    pub ctrl: bool,
    pub in_size: SizeTable,
    pub data_toggle: u32,
    pub out_size: SizeTable,
}

impl RegisterFile {
    /// Combinational read port, unmapped addresses read as 0.
    pub fn read(&self, addr: u8) -> u32 {
        match Reg::try_from(addr & 0xF) {
            Ok(Reg::Addr) => u32::from(self.addr),
            Ok(Reg::EndpOwner) => self.endp_owner,
            Ok(Reg::Ctrl) => u32::from(self.ctrl),
            Ok(Reg::InSize0_7) => self.in_size.word(false),
            Ok(Reg::InSize8_15) => self.in_size.word(true),
            Ok(Reg::DataToggle) => self.data_toggle,
            Ok(Reg::OutSize0_7) => self.out_size.word(false),
            Ok(Reg::OutSize8_15) => self.out_size.word(true),
            Err(_) => 0,
        }
    }

    pub fn attach(&self) -> bool {
        self.ctrl
    }

    pub fn owns(&self, endpoint: EndpointId) -> bool {
        endpoint.is_set(self.endp_owner)
    }

    pub fn toggle(&self, endpoint: EndpointId) -> bool {
        endpoint.is_set(self.data_toggle)
    }

    fn owner_set_mask(bus: &RegBus) -> u32 {
        if bus.wen && bus.addr & 0xF == Reg::EndpOwner as u8 {
            bus.wdata
        } else {
            0
        }
    }

    pub fn next(&self, bus: &RegBus, engine: &EngineUpdate) -> Self {
        let mut next = *self;
        next.endp_owner = owner_combine(self.endp_owner, Self::owner_set_mask(bus), engine.owner_clr);
        if let Some((endpoint, size)) = engine.out_size {
            next.out_size = self.out_size.with(endpoint, size);
        }

        if bus.wen {
            match Reg::try_from(bus.addr & 0xF) {
                Ok(Reg::Addr) => next.addr = (bus.wdata & 0x7F) as u8,
                Ok(Reg::Ctrl) => next.ctrl = bus.wdata & 1 == 1,
                Ok(Reg::InSize0_7) => next.in_size = self.in_size.with_word(false, bus.wdata),
                Ok(Reg::InSize8_15) => next.in_size = self.in_size.with_word(true, bus.wdata),
                Ok(Reg::DataToggle) => next.data_toggle = bus.wdata,
                // ENDP_OWNER goes through the set mask, OUT sizes are read only.
                Ok(Reg::EndpOwner) | Ok(Reg::OutSize0_7) | Ok(Reg::OutSize8_15) | Err(_) => {}
            }
        }
        next
    }
}
