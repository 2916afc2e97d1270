//! CPU side of the bus: a sequencer issuing queued reads and writes the way firmware would.

use std::collections::VecDeque;

pub const ROM_BASE: u32 = 0x0000_0000;
pub const RAM_BASE: u32 = 0x1000_0000;
pub const REGS_BASE: u32 = 0x2000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Rom,
    Ram,
    Regs,
    Unmapped,
}

impl Region {
    /// Decoded from `addr[31:28]`.
    pub fn of(addr: u32) -> Self {
        match addr >> 28 {
            0 => Region::Rom,
            1 => Region::Ram,
            2 => Region::Regs,
            _ => Region::Unmapped,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuRequest {
    pub valid: bool,
    pub addr: u32,
    pub wdata: u32,
    /// Byte lanes to write, 0 for a read.
    pub wstrb: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuResponse {
    pub ready: bool,
    pub rdata: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BusOp {
    Write { addr: u32, data: u32, strobe: u8 },
    Read { addr: u32 },
    /// Read, then write back `((value & !clear) | set) ^ toggle`.
    Modify {
        addr: u32,
        clear: u32,
        set: u32,
        toggle: u32,
    },
}

impl BusOp {
    pub fn write(addr: u32, data: u32) -> Self {
        BusOp::Write {
            addr,
            data,
            strobe: 0xF,
        }
    }

    pub fn addr(&self) -> u32 {
        match *self {
            BusOp::Write { addr, .. } | BusOp::Read { addr } | BusOp::Modify { addr, .. } => addr,
        }
    }
}

/// A completed operation and the value read (reads) or written (writes and modifies).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusResult {
    pub op: BusOp,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pending {
    Access(BusOp),
    WriteBack(BusOp, u32),
}

#[derive(Debug, Clone, Default)]
pub struct CpuPort {
    queue: VecDeque<BusOp>,
    pending: Option<Pending>,
}

impl CpuPort {
    pub fn push(&mut self, op: BusOp) {
        self.queue.push_back(op);
    }

    /// Drops the access in flight and everything queued behind it.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending = None;
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none() && self.queue.is_empty()
    }

    /// The request driven on the bus this cycle.
    pub fn request(&self) -> CpuRequest {
        match self.pending {
            None => CpuRequest::default(),
            Some(Pending::Access(BusOp::Write { addr, data, strobe })) => CpuRequest {
                valid: true,
                addr,
                wdata: data,
                wstrb: strobe,
            },
            Some(Pending::Access(op)) => CpuRequest {
                valid: true,
                addr: op.addr(),
                wdata: 0,
                wstrb: 0,
            },
            Some(Pending::WriteBack(op, value)) => CpuRequest {
                valid: true,
                addr: op.addr(),
                wdata: value,
                wstrb: 0xF,
            },
        }
    }

    /// Clock edge: completes the pending access when the bus is ready, and starts the next
    /// queued operation when idle.
    pub fn next(&mut self, response: &CpuResponse) -> Option<BusResult> {
        let mut result = None;
        if response.ready {
            match self.pending.take() {
                Some(Pending::Access(op)) => match op {
                    BusOp::Write { data, .. } => result = Some(BusResult { op, value: data }),
                    BusOp::Read { .. } => {
                        result = Some(BusResult {
                            op,
                            value: response.rdata,
                        })
                    }
                    BusOp::Modify {
                        clear, set, toggle, ..
                    } => {
                        let value = ((response.rdata & !clear) | set) ^ toggle;
                        self.pending = Some(Pending::WriteBack(op, value));
                    }
                },
                Some(Pending::WriteBack(op, value)) => result = Some(BusResult { op, value }),
                None => {}
            }
        } else if self.pending.is_none() {
            self.pending = self.queue.pop_front().map(Pending::Access);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bus answering every request on the cycle after it shows up, like the register region.
    fn run(cpu: &mut CpuPort, mem: &mut u32) -> Vec<BusResult> {
        let mut ready = false;
        let mut results = Vec::new();
        for _ in 0..32 {
            let req = cpu.request();
            let response = CpuResponse { ready, rdata: *mem };
            if ready && req.wstrb != 0 {
                *mem = req.wdata;
            }
            results.extend(cpu.next(&response));
            ready = !ready && req.valid;
        }
        results
    }

    #[test]
    fn operations_complete_in_order() {
        let mut cpu = CpuPort::default();
        let mut mem = 0x0000_00F0;
        cpu.push(BusOp::write(REGS_BASE + 4, 0x0000_0002));
        cpu.push(BusOp::Read { addr: REGS_BASE });
        assert_eq!(cpu.request(), CpuRequest::default());

        let results = run(&mut cpu, &mut mem);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].value, 0x2);
        assert_eq!(results[1].op, BusOp::Read { addr: REGS_BASE });
        assert_eq!(results[1].value, 0x2);
        assert!(cpu.is_idle());
    }

    #[test]
    fn modify_reads_then_writes_back() {
        let mut cpu = CpuPort::default();
        let mut mem = 0x0000_0F0F;
        cpu.push(BusOp::Modify {
            addr: REGS_BASE + 0x14,
            clear: 0x0000_000F,
            set: 0x0001_0000,
            toggle: 0x0000_0100,
        });
        let results = run(&mut cpu, &mut mem);
        assert_eq!(results.len(), 1);
        assert_eq!(mem, 0x0001_0E00);
        assert_eq!(results[0].value, mem);
    }

    #[test]
    fn regions() {
        assert_eq!(Region::of(ROM_BASE + 0x40), Region::Rom);
        assert_eq!(Region::of(RAM_BASE + 0x3FF), Region::Ram);
        assert_eq!(Region::of(REGS_BASE + 0x1C), Region::Regs);
        assert_eq!(Region::of(0x3000_0000), Region::Unmapped);
    }
}
