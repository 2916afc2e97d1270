use std::io::Write;

use anyhow::{Context, Result};
use vcd::{IdCode, TimescaleUnit, Value};

use crate::device::engine::State;

/// Signals dumped for one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceSample {
    pub host_j_not_k: bool,
    pub host_se0: bool,
    pub oe: bool,
    pub dev_j_not_k: bool,
    pub dev_se0: bool,
    pub sample_en: bool,
    pub bit_valid: bool,
    pub bit: bool,
    pub state: State,
    pub token_valid: bool,
    pub mem_wen: bool,
    pub mem_ren: bool,
    pub mem_addr: u16,
    pub cpu_valid: bool,
    pub cpu_ready: bool,
    pub endp_owner: u32,
}

struct Ids {
    host_j_not_k: IdCode,
    host_se0: IdCode,
    oe: IdCode,
    dev_j_not_k: IdCode,
    dev_se0: IdCode,
    sample_en: IdCode,
    bit_valid: IdCode,
    bit: IdCode,
    state: IdCode,
    token_valid: IdCode,
    mem_wen: IdCode,
    mem_ren: IdCode,
    mem_addr: IdCode,
    cpu_valid: IdCode,
    cpu_ready: IdCode,
    endp_owner: IdCode,
}

/// Waveform dump, one timestamp per clock cycle with only the changed signals.
pub struct VcdTrace<W: Write> {
    output: W,
    ids: Ids,
    last: Option<TraceSample>,
    period_ps: u64,
}

fn vector(value: u32, width: u32) -> Vec<Value> {
    (0..width)
        .rev()
        .map(|i| Value::from((value >> i) & 1 == 1))
        .collect()
}

impl<W: Write> VcdTrace<W> {
    /// `period_ps`: clock period in picoseconds.
    pub fn new(mut output: W, period_ps: u64) -> Result<Self> {
        let mut writer = vcd::Writer::new(&mut output);
        writer.timescale(1, TimescaleUnit::PS)?;
        writer.add_module("usb_soc")?;
        let ids = Ids {
            host_j_not_k: writer.add_wire(1, "host_j_not_k")?,
            host_se0: writer.add_wire(1, "host_se0")?,
            oe: writer.add_wire(1, "usb_oe")?,
            dev_j_not_k: writer.add_wire(1, "usb_j_not_k")?,
            dev_se0: writer.add_wire(1, "usb_se0")?,
            sample_en: writer.add_wire(1, "sample_en")?,
            bit_valid: writer.add_wire(1, "bit_en")?,
            bit: writer.add_wire(1, "bit")?,
            state: writer.add_wire(5, "state")?,
            token_valid: writer.add_wire(1, "token_valid")?,
            mem_wen: writer.add_wire(1, "mem_wen")?,
            mem_ren: writer.add_wire(1, "mem_ren")?,
            mem_addr: writer.add_wire(10, "mem_addr")?,
            cpu_valid: writer.add_wire(1, "cpu_valid")?,
            cpu_ready: writer.add_wire(1, "cpu_ready")?,
            endp_owner: writer.add_wire(32, "endp_owner")?,
        };
        writer.upscope()?;
        writer.enddefinitions()?;
        Ok(Self {
            output,
            ids,
            last: None,
            period_ps,
        })
    }

    pub fn sample(&mut self, cycle: u64, s: &TraceSample) -> Result<()> {
        let last = self.last.replace(*s);
        if last.as_ref() == Some(s) {
            return Ok(());
        }
        // the writer only borrows the sink; id codes live in `ids`
        let mut writer = vcd::Writer::new(&mut self.output);
        writer
            .timestamp(cycle * self.period_ps)
            .context("Writing trace")?;

        let ids = &self.ids;
        let scalars = [
            (ids.host_j_not_k, s.host_j_not_k, last.map(|l| l.host_j_not_k)),
            (ids.host_se0, s.host_se0, last.map(|l| l.host_se0)),
            (ids.oe, s.oe, last.map(|l| l.oe)),
            (ids.dev_j_not_k, s.dev_j_not_k, last.map(|l| l.dev_j_not_k)),
            (ids.dev_se0, s.dev_se0, last.map(|l| l.dev_se0)),
            (ids.sample_en, s.sample_en, last.map(|l| l.sample_en)),
            (ids.bit_valid, s.bit_valid, last.map(|l| l.bit_valid)),
            (ids.bit, s.bit, last.map(|l| l.bit)),
            (ids.token_valid, s.token_valid, last.map(|l| l.token_valid)),
            (ids.mem_wen, s.mem_wen, last.map(|l| l.mem_wen)),
            (ids.mem_ren, s.mem_ren, last.map(|l| l.mem_ren)),
            (ids.cpu_valid, s.cpu_valid, last.map(|l| l.cpu_valid)),
            (ids.cpu_ready, s.cpu_ready, last.map(|l| l.cpu_ready)),
        ];
        for &(id, value, old) in scalars.iter() {
            if old != Some(value) {
                writer.change_scalar(id, value)?;
            }
        }

        let vectors = [
            (ids.state, 5, s.state as u32, last.map(|l| l.state as u32)),
            (ids.mem_addr, 10, u32::from(s.mem_addr), last.map(|l| u32::from(l.mem_addr))),
            (ids.endp_owner, 32, s.endp_owner, last.map(|l| l.endp_owner)),
        ];
        for &(id, width, value, old) in vectors.iter() {
            if old != Some(value) {
                writer.change_vector(id, &vector(value, width))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(state: State) -> TraceSample {
        TraceSample {
            host_j_not_k: true,
            host_se0: false,
            oe: false,
            dev_j_not_k: true,
            dev_se0: false,
            sample_en: true,
            bit_valid: true,
            bit: true,
            state,
            token_valid: false,
            mem_wen: false,
            mem_ren: false,
            mem_addr: 0x88,
            cpu_valid: false,
            cpu_ready: false,
            endp_owner: 0x0004_0002,
        }
    }

    #[test]
    fn dumps_only_changes() {
        let mut out = Vec::new();
        {
            let mut trace = VcdTrace::new(&mut out, 1000).unwrap();
            trace.sample(0, &sample(State::WaitSync)).unwrap();
            trace.sample(1, &sample(State::WaitSync)).unwrap();
            trace.sample(2, &sample(State::WaitPid)).unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("$var wire 5"));
        assert!(text.contains("#0\n"));
        assert!(!text.contains("#1000\n"));
        assert!(text.contains("#2000\n"));
        // WaitPid is state 1
        assert!(text.contains("b00001 "));
    }

    #[test]
    fn changes_use_the_declared_ids() {
        let mut out = Vec::new();
        {
            let mut trace = VcdTrace::new(&mut out, 8333).unwrap();
            trace.sample(0, &sample(State::WaitSync)).unwrap();
            trace.sample(3, &sample(State::WaitPid)).unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("$enddefinitions").count(), 1);
        let state_id = text
            .lines()
            .find(|l| l.ends_with(" state $end"))
            .and_then(|l| l.split_whitespace().nth(3))
            .unwrap();
        assert!(text.contains("#24999\n"));
        assert!(text.contains(&format!("b00001 {}\n", state_id)));
    }
}
