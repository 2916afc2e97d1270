//! The device in its system: endpoint RAM, firmware ROM and the CPU bus around the controller,
//! with a host driving the line.
//!
//! The CPU is modelled by the bus operations it issues, so firmware behaviour is expressed with
//! the helpers below (`owner_set`, `copy_in`, ...) rather than by running an image. The ROM is
//! still mapped and readable.

pub mod cpu;
pub mod memory;
pub mod trace;

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use structopt::StructOpt;

use crate::device::bit_sync::OVERSAMPLE;
use crate::device::regs::{Direction, EndpointId, Reg, RegBus};
use crate::device::{Inputs, Outputs, UsbDevice};
use crate::pipeline::{self, Event, EventData, EventIterator, Pipeline};
use crate::source::script::{self, Command, ToggleOp};
use crate::usb::byte::BIT_LEN;
use crate::usb::packet::Packet;
use crate::usb::signal::{self, Signal};
use crate::usb::types::TokenType;
use cpu::{BusOp, BusResult, CpuPort, CpuRequest, CpuResponse, Region, RAM_BASE, REGS_BASE, ROM_BASE};
use memory::{EndpointRam, RamPort, Rom};
use trace::{TraceSample, VcdTrace};

/// Cycles a CPU access may wait for its ready before giving up.
pub const BUS_TIMEOUT: u32 = 256;

/// The engine always wins the RAM port.
fn ram_port(req: &CpuRequest, out: &Outputs) -> Option<RamPort> {
    if out.mem_ren || out.mem_wen {
        Some(RamPort::byte(out.mem_addr, out.mem_wen, out.mem_wdata))
    } else if req.valid && Region::of(req.addr) == Region::Ram {
        Some(RamPort {
            row: ((req.addr >> 2) & 0xFF) as u8,
            wstrb: req.wstrb,
            wdata: req.wdata,
        })
    } else {
        None
    }
}

/// Ready is raised the cycle after a request shows up, for a single cycle. RAM accesses wait for
/// a cycle without engine access, unmapped ones never complete.
fn next_ready(req: &CpuRequest, ready: bool, usb_ram_access: bool) -> bool {
    let granted = match Region::of(req.addr) {
        Region::Rom | Region::Regs => true,
        Region::Ram => !usb_ram_access,
        Region::Unmapped => false,
    };
    req.valid && !ready && granted
}

pub struct Soc {
    device: UsbDevice,
    ram: EndpointRam,
    rom: Rom,
    rom_rdata: u32,
    cpu: CpuPort,
    cpu_ready: bool,
    cpu_result: Option<BusResult>,
    usb_read_lane: u8,

    cycle: u64,
    host: Signal,
    bus: Option<Signal>,
    bus_events: VecDeque<(f64, Signal)>,
    trace: Option<VcdTrace<Box<dyn Write>>>,
}

impl Soc {
    pub fn new(oversample: u8, rom: Rom) -> Self {
        Self {
            device: UsbDevice::new(oversample),
            ram: EndpointRam::new(),
            rom,
            rom_rdata: 0,
            cpu: CpuPort::default(),
            cpu_ready: false,
            cpu_result: None,
            usb_read_lane: 0,
            cycle: 0,
            host: Signal::J,
            bus: None,
            bus_events: VecDeque::new(),
            trace: None,
        }
    }

    pub fn with_trace(self, output: Box<dyn Write>) -> Result<Self> {
        // one clock period in picoseconds
        let period = (BIT_LEN * 1e12 / f64::from(self.device.oversample())).round() as u64;
        Ok(Self {
            trace: Some(VcdTrace::new(output, period)?),
            ..self
        })
    }

    pub fn device(&self) -> &UsbDevice {
        &self.device
    }

    pub fn ram(&self) -> &EndpointRam {
        &self.ram
    }

    /// Simulated time in seconds.
    pub fn time(&self) -> f64 {
        self.cycle as f64 * BIT_LEN / f64::from(self.device.oversample())
    }

    /// Runs one clock cycle of the whole system.
    pub fn step(&mut self) -> Result<Outputs> {
        let req = self.cpu.request();
        let region = Region::of(req.addr);
        let regs_sel = req.valid && region == Region::Regs;
        let state = self.device.state();
        let token_valid = self.device.engine().token_valid();
        let endp_owner = self.device.regs().endp_owner;

        let (j_not_k, se0) = self.host.levels();
        let out = self.device.step(&Inputs {
            j_not_k,
            se0,
            mem_rdata: self.ram.rdata().to_le_bytes()[usize::from(self.usb_read_lane)],
            reg: RegBus {
                wen: regs_sel && req.wstrb != 0,
                ren: regs_sel,
                addr: ((req.addr >> 2) & 0xF) as u8,
                wdata: req.wdata,
            },
        });

        let usb_ram_access = out.mem_ren || out.mem_wen;
        let port = ram_port(&req, &out);
        let response = CpuResponse {
            ready: self.cpu_ready,
            rdata: match region {
                Region::Rom => self.rom_rdata,
                Region::Ram => self.ram.rdata(),
                Region::Regs => out.reg_rdata,
                Region::Unmapped => 0,
            },
        };

        self.ram.next(port);
        self.rom_rdata = self.rom.word((req.addr >> 2) & 0x3FF);
        if out.mem_ren {
            self.usb_read_lane = (out.mem_addr & 0x3) as u8;
        }
        if let Some(result) = self.cpu.next(&response) {
            self.cpu_result = Some(result);
        }
        self.cpu_ready = next_ready(&req, self.cpu_ready, usb_ram_access);

        let bus = if out.oe {
            Signal::from_levels(out.j_not_k, out.se0)
        } else {
            self.host
        };
        if self.bus != Some(bus) {
            self.bus = Some(bus);
            let ts = self.time();
            self.bus_events.push_back((ts, bus));
        }

        if let Some(trace) = self.trace.as_mut() {
            let probe = self.device.probe();
            trace.sample(
                self.cycle,
                &TraceSample {
                    host_j_not_k: j_not_k,
                    host_se0: se0,
                    oe: out.oe,
                    dev_j_not_k: out.j_not_k,
                    dev_se0: out.se0,
                    sample_en: probe.sample_en,
                    bit_valid: probe.bit_valid,
                    bit: probe.bit,
                    state,
                    token_valid,
                    mem_wen: out.mem_wen,
                    mem_ren: out.mem_ren,
                    mem_addr: out.mem_addr,
                    cpu_valid: req.valid,
                    cpu_ready: response.ready,
                    endp_owner,
                },
            )?;
        }

        self.cycle += 1;
        Ok(out)
    }

    /// Bus transitions seen since the last call: the device's drive while it has output enable,
    /// the host's otherwise.
    pub fn bus_events(&mut self) -> impl Iterator<Item = (f64, Signal)> + '_ {
        self.bus_events.drain(..)
    }

    /// Current bus state, closing the last run of transitions.
    pub fn flush(&self) -> (f64, Signal) {
        (self.time(), self.bus.unwrap_or(Signal::J))
    }

    /// Holds `symbol` for one bit period, returning the outputs of its last cycle.
    fn bit(&mut self, symbol: Signal) -> Result<Outputs> {
        self.host = symbol;
        let mut out = Outputs::default();
        for _ in 0..self.device.oversample() {
            out = self.step()?;
        }
        Ok(out)
    }

    /// Host symbols change on bit period boundaries.
    fn align(&mut self) -> Result<()> {
        while self.cycle % u64::from(self.device.oversample()) != 0 {
            self.step()?;
        }
        Ok(())
    }

    pub fn send(&mut self, line: &[Signal]) -> Result<()> {
        self.align()?;
        for &symbol in line {
            self.bit(symbol)?;
        }
        Ok(())
    }

    pub fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        log::debug!("host sends {:?}", packet);
        self.send(&signal::encode(&packet.to_bytes()))
    }

    pub fn idle(&mut self, bits: u32) -> Result<()> {
        self.align()?;
        for _ in 0..bits {
            self.bit(Signal::J)?;
        }
        Ok(())
    }

    /// Idles J and captures what the device drives, waiting at most `max_bits` bit periods and
    /// carrying on for as long as the device keeps output enable asserted.
    pub fn listen(&mut self, max_bits: u32) -> Result<Vec<Signal>> {
        self.align()?;
        let mut line = Vec::new();
        let mut bits = 0;
        loop {
            let out = self.bit(Signal::J)?;
            bits += 1;
            if out.oe {
                line.push(Signal::from_levels(out.j_not_k, out.se0));
            } else if bits >= max_bits {
                break;
            }
        }
        Ok(line)
    }

    /// Runs `op` to completion on the CPU bus, returning the value read or written.
    pub fn bus(&mut self, op: BusOp) -> Result<u32> {
        anyhow::ensure!(self.cpu.is_idle(), "CPU port busy");
        self.cpu.push(op);
        for _ in 0..BUS_TIMEOUT {
            self.step()?;
            if let Some(result) = self.cpu_result.take() {
                return Ok(result.value);
            }
        }
        self.cpu.clear();
        anyhow::bail!("Bus timeout accessing {:#010x}", op.addr())
    }

    fn reg_addr(reg: Reg) -> u32 {
        REGS_BASE + 4 * reg as u32
    }

    pub fn reg_write(&mut self, reg: Reg, value: u32) -> Result<()> {
        self.bus(BusOp::write(Self::reg_addr(reg), value)).map(drop)
    }

    pub fn reg_read(&mut self, reg: Reg) -> Result<u32> {
        self.bus(BusOp::Read {
            addr: Self::reg_addr(reg),
        })
    }

    pub fn reg_modify(&mut self, reg: Reg, clear: u32, set: u32, toggle: u32) -> Result<u32> {
        self.bus(BusOp::Modify {
            addr: Self::reg_addr(reg),
            clear,
            set,
            toggle,
        })
    }

    /// Byte stores, one lane strobe each.
    pub fn ram_write(&mut self, offset: u16, bytes: &[u8]) -> Result<()> {
        for (addr, &byte) in (u32::from(offset)..).zip(bytes) {
            let lane = addr & 0x3;
            self.bus(BusOp::Write {
                addr: RAM_BASE + (addr & 0x3FC),
                data: u32::from(byte) << (8 * lane),
                strobe: 1 << lane,
            })?;
        }
        Ok(())
    }

    pub fn ram_read(&mut self, offset: u16, len: u16) -> Result<Vec<u8>> {
        (u32::from(offset)..u32::from(offset) + u32::from(len))
            .map(|addr| -> Result<u8> {
                let word = self.bus(BusOp::Read {
                    addr: RAM_BASE + (addr & 0x3FC),
                })?;
                Ok((word >> (8 * (addr & 0x3))) as u8)
            })
            .collect()
    }

    pub fn rom_read(&mut self, offset: u32) -> Result<u32> {
        self.bus(BusOp::Read {
            addr: ROM_BASE + (offset & 0xFFC),
        })
    }

    /// Hands the endpoint buffer over to the engine.
    pub fn owner_set(&mut self, endpoint: EndpointId) -> Result<()> {
        self.reg_write(Reg::EndpOwner, endpoint.mask())
    }

    pub fn owns(&mut self, endpoint: EndpointId) -> Result<bool> {
        Ok(endpoint.is_set(self.reg_read(Reg::EndpOwner)?))
    }

    pub fn toggle_set(&mut self, endpoint: EndpointId) -> Result<()> {
        self.reg_modify(Reg::DataToggle, 0, endpoint.mask(), 0)
            .map(drop)
    }

    pub fn toggle_clear(&mut self, endpoint: EndpointId) -> Result<()> {
        self.reg_modify(Reg::DataToggle, endpoint.mask(), 0, 0)
            .map(drop)
    }

    pub fn toggle_toggle(&mut self, endpoint: EndpointId) -> Result<()> {
        self.reg_modify(Reg::DataToggle, 0, 0, endpoint.mask())
            .map(drop)
    }

    fn size_reg(number: u8, input: bool) -> (Reg, u32) {
        let shift = 4 * u32::from(number & 0x7);
        let reg = match (input, number < 8) {
            (true, true) => Reg::InSize0_7,
            (true, false) => Reg::InSize8_15,
            (false, true) => Reg::OutSize0_7,
            (false, false) => Reg::OutSize8_15,
        };
        (reg, shift)
    }

    pub fn in_size_set(&mut self, number: u8, size: u8) -> Result<()> {
        let (reg, shift) = Self::size_reg(number, true);
        self.reg_modify(reg, 0xF << shift, u32::from(size & 0xF) << shift, 0)
            .map(drop)
    }

    pub fn out_size_get(&mut self, number: u8) -> Result<u8> {
        let (reg, shift) = Self::size_reg(number, false);
        Ok(((self.reg_read(reg)? >> shift) & 0xF) as u8)
    }

    /// Fills the IN buffer of endpoint `number`.
    pub fn copy_in(&mut self, number: u8, bytes: &[u8]) -> Result<()> {
        anyhow::ensure!(bytes.len() <= 8, "IN buffers hold 8 bytes");
        let addr = EndpointId::new(Direction::In, number).buffer_addr(0);
        self.ram_write(addr, bytes)
    }

    /// Reads back the OUT buffer of endpoint `number`.
    pub fn copy_out(&mut self, number: u8, len: u8) -> Result<Vec<u8>> {
        let addr = EndpointId::new(Direction::Out, number).buffer_addr(0);
        self.ram_read(addr, u16::from(len.min(8)))
    }

    /// Executes one scenario command. `auto_listen` is the answer window opened after IN tokens
    /// and DATA packets, 0 for none.
    pub fn run(&mut self, cmd: &Command, auto_listen: u32) -> Result<()> {
        match cmd {
            Command::Packet(packet) => {
                self.send_packet(packet)?;
                let awaits_answer = match packet {
                    Packet::Token(token) => token.token_type == TokenType::In,
                    Packet::Data(_) => true,
                    _ => false,
                };
                if awaits_answer && auto_listen != 0 {
                    self.answer(auto_listen)?;
                }
            }
            Command::Line(line) => self.send(line)?,
            Command::Idle(bits) => self.idle(*bits)?,
            Command::Listen(bits) => self.answer(bits.unwrap_or(auto_listen))?,
            Command::RegWrite(reg, value) => {
                self.reg_write(*reg, *value)?;
                log::info!("{:?} <- {:#010x}", reg, value);
            }
            Command::RegRead(reg) => {
                let value = self.reg_read(*reg)?;
                log::info!("{:?} = {:#010x}", reg, value);
            }
            Command::RamWrite(offset, bytes) => {
                self.ram_write(*offset, bytes)?;
                log::info!("RAM[{:#05x}] <- {:02x?}", offset, bytes);
            }
            Command::RamRead(offset, len) => {
                let bytes = self.ram_read(*offset, *len)?;
                log::info!("RAM[{:#05x}] = {:02x?}", offset, bytes);
            }
            Command::RomRead(offset) => {
                let value = self.rom_read(*offset)?;
                log::info!("ROM[{:#06x}] = {:#010x}", offset, value);
            }
            Command::OwnerSet(endpoint) => {
                self.owner_set(*endpoint)?;
                log::info!("{:?} {} handed to the engine", endpoint.direction, endpoint.number);
            }
            Command::OwnerGet(endpoint) => {
                let owned = self.owns(*endpoint)?;
                log::info!(
                    "{:?} {} owned by the {}",
                    endpoint.direction,
                    endpoint.number,
                    if owned { "engine" } else { "CPU" }
                );
            }
            Command::Toggle(op, endpoint) => {
                match op {
                    ToggleOp::Set => self.toggle_set(*endpoint)?,
                    ToggleOp::Clear => self.toggle_clear(*endpoint)?,
                    ToggleOp::Toggle => self.toggle_toggle(*endpoint)?,
                }
                log::info!("DATA_TOGGLE {:?} {:?} {}", op, endpoint.direction, endpoint.number);
            }
            Command::InSize(number, size) => {
                self.in_size_set(*number, *size)?;
                log::info!("IN {} size <- {}", number, size);
            }
            Command::OutSize(number) => {
                let size = self.out_size_get(*number)?;
                log::info!("OUT {} size = {}", number, size);
            }
            Command::CopyIn(number, bytes) => {
                self.copy_in(*number, bytes)?;
                log::info!("IN {} buffer <- {:02x?}", number, bytes);
            }
            Command::CopyOut(number, len) => {
                let bytes = self.copy_out(*number, *len)?;
                log::info!("OUT {} buffer = {:02x?}", number, bytes);
            }
        }
        Ok(())
    }

    fn answer(&mut self, max_bits: u32) -> Result<()> {
        let line = self.listen(max_bits)?;
        let engine = self.device.engine();
        log::debug!(
            "last pid {:?}, token {:?}",
            engine.rx_pid(),
            engine.token()
        );
        if line.is_empty() {
            log::info!("no answer");
        } else {
            let bytes = signal::decode(&line).context("Decoding the device's answer")?;
            log::info!("device answers {:02x?}", bytes);
        }
        Ok(())
    }
}

/// Runs scenario commands and emits the resulting bus transitions.
pub struct SocIterator<T> {
    it: T,
    soc: Soc,
    listen: u32,
    ev_queue: VecDeque<Event>,
    done: bool,
}

impl<T> SocIterator<T> {
    pub fn new(input: T, soc: Soc, listen: u32) -> Self {
        Self {
            it: input,
            soc,
            listen,
            ev_queue: VecDeque::new(),
            done: false,
        }
    }

    fn queue_bus_events(&mut self) {
        let events = self
            .soc
            .bus_events()
            .map(|(ts, sig)| (ts, Ok(Box::new(sig) as Box<dyn EventData>)))
            .collect::<Vec<_>>();
        self.ev_queue.extend(events);
    }
}

impl<T> Iterator for SocIterator<T>
where
    T: Iterator<Item = Event>,
{
    type Item = Event;
    fn next(&mut self) -> Option<Self::Item> {
        while self.ev_queue.is_empty() && !self.done {
            let res = match self.it.next() {
                Some((_, Ok(ev))) => {
                    let cmd = *pipeline::downcast::<Command>(ev);
                    self.soc.run(&cmd, self.listen)
                }
                Some((_, Err(e))) => Err(e),
                None => {
                    self.done = true;
                    self.queue_bus_events();
                    let (ts, sig) = self.soc.flush();
                    self.ev_queue.push_back((ts, Ok(Box::new(sig))));
                    break;
                }
            };
            self.queue_bus_events();
            if let Err(e) = res {
                self.ev_queue.push_back((self.soc.time(), Err(e)));
            }
        }
        self.ev_queue.pop_front()
    }
}

impl<T: 'static + Iterator<Item = Event>> EventIterator for SocIterator<T> {
    fn into_iterator(self: Box<Self>) -> Box<dyn Iterator<Item = Event>> {
        self
    }
    fn event_type(&self) -> std::any::TypeId {
        std::any::TypeId::of::<Signal>()
    }
    fn event_type_name(&self) -> &'static str {
        std::any::type_name::<Signal>()
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "soc", about = "Simulates the device controller in its system.")]
struct Opts {
    /// Clock cycles per bit period.
    #[structopt(long, default_value = "10")]
    oversample: u8,
    /// Bit periods to wait for the device's answer after IN tokens and DATA packets, 0 disables.
    #[structopt(long, default_value = "16")]
    listen: u32,
    /// Waveform dump of every clock cycle.
    #[structopt(long, parse(from_os_str))]
    vcd: Option<PathBuf>,
    /// Firmware image mapped at address 0.
    #[structopt(long, parse(from_os_str))]
    rom: Option<PathBuf>,
    /// Set to print events to stdout.
    #[structopt(short, long)]
    verbose: bool,
}

fn soc_from(opts: &Opts) -> Result<Soc> {
    anyhow::ensure!(
        opts.oversample >= 4,
        "oversampling ratio must be at least 4, got {}",
        opts.oversample
    );
    let rom = match &opts.rom {
        Some(path) => Rom::load(path)?,
        None => Rom::default(),
    };
    let soc = Soc::new(opts.oversample, rom);
    match &opts.vcd {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Creating {}", path.display()))?;
            soc.with_trace(Box::new(std::io::BufWriter::new(file)))
        }
        None => Ok(soc),
    }
}

pub fn build(pipeline: &mut Pipeline, args: &[String]) {
    let opts = Opts::from_iter(std::iter::once("soc".to_string()).chain(args.iter().cloned()));
    let soc = soc_from(&opts).unwrap_or_else(|e| {
        eprintln!("{:#}", e);
        std::process::exit(1);
    });
    log::debug!("{:?}", opts);

    pipeline::ensure_upstream::<Command>(pipeline, script::build);
    let it = pipeline::take_upstream(pipeline, "soc");
    let node = Box::new(SocIterator::new(it, soc, opts.listen));
    pipeline.push(crate::sink::verbose(node, opts.verbose));
}

impl Default for Soc {
    fn default() -> Self {
        Self::new(OVERSAMPLE, Rom::default())
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::*;
    use crate::device::pid::Pid;
    use crate::usb::byte::ByteIterator;
    use crate::usb::packet::PacketIterator;
    use crate::usb::protocol::{self, ProtocolIterator, Transaction};
    use crate::usb::types::{Data, DataPID, HandShake, Token};

    fn token(token_type: TokenType, address: u8, endpoint: u8) -> Packet {
        Packet::Token(Token {
            token_type,
            address,
            endpoint,
        })
    }

    fn data0(payload: &[u8]) -> Packet {
        Packet::Data(Data {
            pid: DataPID::Data0,
            payload: payload.to_vec(),
        })
    }

    fn addressed_soc(address: u8) -> Soc {
        let mut soc = Soc::default();
        soc.idle(4).unwrap();
        soc.reg_write(Reg::Addr, u32::from(address)).unwrap();
        soc
    }

    /// Sends `packet` and decodes the answer, if any.
    fn exchange(soc: &mut Soc, packet: &Packet) -> Option<Vec<u8>> {
        soc.send_packet(packet).unwrap();
        let line = soc.listen(16).unwrap();
        if line.is_empty() {
            None
        } else {
            Some(signal::decode(&line).unwrap())
        }
    }

    fn out_ep(number: u8) -> EndpointId {
        EndpointId::new(Direction::Out, number)
    }

    fn in_ep(number: u8) -> EndpointId {
        EndpointId::new(Direction::In, number)
    }

    #[test]
    fn setup_to_own_address() {
        let mut soc = addressed_soc(5);
        assert_eq!(exchange(&mut soc, &token(TokenType::Setup, 5, 0)), None);
        assert!(soc.device().engine().token_valid());
        assert_eq!(soc.device().engine().token(), (5, 0));
    }

    #[test]
    fn token_to_another_address() {
        let mut soc = addressed_soc(5);
        assert_eq!(exchange(&mut soc, &token(TokenType::Setup, 6, 0)), None);
        assert!(!soc.device().engine().token_valid());
        assert_eq!(soc.device().state(), crate::device::engine::State::WaitSync);
    }

    #[test]
    fn out_data_lands_in_the_endpoint_buffer() {
        let mut soc = addressed_soc(5);
        soc.owner_set(out_ep(1)).unwrap();
        assert!(soc.owns(out_ep(1)).unwrap());

        soc.send_packet(&token(TokenType::Out, 5, 1)).unwrap();
        soc.idle(2).unwrap();
        let answer = exchange(&mut soc, &data0(&[0x23, 0x64, 0x54]));
        assert_eq!(answer, Some(vec![0x80, Pid::Ack.byte()]));

        assert_eq!(soc.ram().peek(8), 0x23);
        assert_eq!(soc.copy_out(1, 3).unwrap(), vec![0x23, 0x64, 0x54]);
        assert_eq!(soc.ram().peek(11), 0);
        assert!(!soc.owns(out_ep(1)).unwrap());
        assert_eq!(soc.out_size_get(1).unwrap(), 3);
    }

    #[test]
    fn scripts_drive_the_firmware_helpers() {
        let text = "
            reg write ADDR 5
            owner set out 1
            out 5 1
            idle 2
            data0 23 64 54
            size out 1
            copy out 1 3
            copy in 2 de ad be
            size in 2 3
            toggle set in 2
            toggle toggle in 2
            toggle toggle in 2
            owner set in 2
            owner get in 2
            in 5 2
            ack
            idle 4
            owner get in 2
        ";
        let mut soc = Soc::default();
        for cmd in script::parse(text) {
            soc.run(&cmd.unwrap(), 16).unwrap();
        }

        let regs = *soc.device().regs();
        assert_eq!(regs.endp_owner, 0);
        assert_eq!(regs.out_size.get(1), 3);
        assert_eq!(regs.in_size.get(2), 3);
        assert!(in_ep(2).is_set(regs.data_toggle));
        assert_eq!(soc.copy_out(1, 3).unwrap(), vec![0x23, 0x64, 0x54]);
        assert_eq!(
            soc.ram_read(in_ep(2).buffer_addr(0), 3).unwrap(),
            vec![0xDE, 0xAD, 0xBE]
        );
    }

    #[test]
    fn corrupted_data_is_dropped_silently() {
        let mut soc = addressed_soc(5);
        soc.owner_set(out_ep(1)).unwrap();

        soc.send_packet(&token(TokenType::Out, 5, 1)).unwrap();
        soc.idle(2).unwrap();
        let mut bytes = data0(&[0x23, 0x64, 0x54]).to_bytes();
        if let Some(crc) = bytes.last_mut() {
            *crc ^= 0x01;
        }
        soc.send(&signal::encode(&bytes)).unwrap();
        assert!(soc.listen(16).unwrap().is_empty());

        assert_eq!(soc.ram_read(8, 3).unwrap(), vec![0, 0, 0]);
        assert!(soc.owns(out_ep(1)).unwrap());
        assert_eq!(soc.out_size_get(1).unwrap(), 0);
    }

    #[test]
    fn in_data_then_host_ack_releases_the_buffer() {
        let payload = [0x12, 0x01, 0x00, 0x02, 0x02];
        let mut soc = addressed_soc(5);
        soc.copy_in(2, &payload).unwrap();
        soc.in_size_set(2, payload.len() as u8).unwrap();
        soc.owner_set(in_ep(2)).unwrap();

        let answer = exchange(&mut soc, &token(TokenType::In, 5, 2)).unwrap();
        assert_eq!(
            Packet::try_from(&answer as &[u8]).unwrap(),
            data0(&payload)
        );
        assert!(soc.owns(in_ep(2)).unwrap());

        soc.send_packet(&Packet::HandShake(HandShake::Ack)).unwrap();
        soc.idle(4).unwrap();
        assert!(!soc.owns(in_ep(2)).unwrap());
        assert_eq!(soc.reg_read(Reg::EndpOwner).unwrap() & (1 << 18), 0);
    }

    #[test]
    fn out_to_unowned_endpoint_is_nakked() {
        let mut soc = addressed_soc(5);
        soc.send_packet(&token(TokenType::Out, 5, 1)).unwrap();
        soc.idle(2).unwrap();
        let answer = exchange(&mut soc, &data0(&[0x23, 0x64, 0x54]));
        assert_eq!(answer, Some(vec![0x80, Pid::Nak.byte()]));
        assert_eq!(soc.ram().peek(8), 0);
        assert_eq!(soc.out_size_get(1).unwrap(), 0);
    }

    #[test]
    fn zero_length_in_with_toggle_set() {
        let mut soc = addressed_soc(0);
        soc.toggle_set(in_ep(0)).unwrap();
        soc.owner_set(in_ep(0)).unwrap();
        let answer = exchange(&mut soc, &token(TokenType::In, 0, 0));
        assert_eq!(answer, Some(vec![0x80, Pid::Data1.byte(), 0x00, 0x00]));

        soc.toggle_toggle(in_ep(0)).unwrap();
        assert_eq!(soc.reg_read(Reg::DataToggle).unwrap(), 0);
        soc.toggle_toggle(in_ep(0)).unwrap();
        soc.toggle_clear(in_ep(0)).unwrap();
        assert_eq!(soc.reg_read(Reg::DataToggle).unwrap(), 0);
    }

    #[test]
    fn in_sizes_share_registers() {
        let mut soc = Soc::default();
        soc.in_size_set(1, 8).unwrap();
        soc.in_size_set(2, 5).unwrap();
        soc.in_size_set(9, 3).unwrap();
        assert_eq!(soc.reg_read(Reg::InSize0_7).unwrap(), 0x0000_0580);
        assert_eq!(soc.reg_read(Reg::InSize8_15).unwrap(), 0x0000_0030);
    }

    #[test]
    fn engine_wins_the_ram_port() {
        let cpu = CpuRequest {
            valid: true,
            addr: RAM_BASE + 0x10,
            wdata: 0xAABB_CCDD,
            wstrb: 0xF,
        };
        let engine = Outputs {
            mem_wen: true,
            mem_addr: 9,
            mem_wdata: 0x64,
            ..Outputs::default()
        };
        assert_eq!(ram_port(&cpu, &engine), Some(RamPort::byte(9, true, 0x64)));
        assert!(!next_ready(&cpu, false, true));

        let idle = Outputs::default();
        assert_eq!(
            ram_port(&cpu, &idle),
            Some(RamPort {
                row: 4,
                wstrb: 0xF,
                wdata: 0xAABB_CCDD
            })
        );
        assert!(next_ready(&cpu, false, false));
        assert!(!next_ready(&cpu, true, false));

        let regs = CpuRequest {
            addr: REGS_BASE,
            ..cpu
        };
        assert_eq!(ram_port(&regs, &idle), None);
        assert!(next_ready(&regs, false, true));
    }

    #[test]
    fn ram_words_and_bytes() {
        let mut soc = Soc::default();
        soc.ram_write(0x91, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(soc.ram_read(0x90, 6).unwrap(), vec![0, 0xDE, 0xAD, 0xBE, 0xEF, 0]);
        assert_eq!(
            soc.bus(BusOp::Read {
                addr: RAM_BASE + 0x94
            })
            .unwrap(),
            0x0000_00EF
        );
    }

    #[test]
    fn unmapped_access_times_out() {
        let mut soc = Soc::default();
        assert!(soc.bus(BusOp::Read { addr: 0x3000_0000 }).is_err());
        // the bus is usable again afterwards
        soc.reg_write(Reg::Addr, 0x2A).unwrap();
        assert_eq!(soc.reg_read(Reg::Addr).unwrap(), 0x2A);
    }

    #[test]
    fn rom_is_mapped_at_zero() {
        let mut soc = Soc::new(OVERSAMPLE, Rom::from_bytes(&[1, 0, 0, 0, 0x37, 0x01, 0x00, 0x10]));
        assert_eq!(soc.rom_read(4).unwrap(), 0x1000_0137);
        assert_eq!(soc.rom_read(0x100).unwrap(), 0);
    }

    #[test]
    fn bus_decodes_through_the_analyzers() {
        let commands = vec![
            Command::RegWrite(Reg::EndpOwner, in_ep(0).mask()),
            Command::Packet(token(TokenType::In, 0, 0)),
            Command::Packet(Packet::HandShake(HandShake::Ack)),
            Command::Idle(4),
        ];
        let events = commands
            .into_iter()
            .map(|cmd| (0., Ok(Box::new(cmd) as Box<dyn EventData>)));
        let bus = SocIterator::new(events, Soc::default(), 16);
        let transactions = ProtocolIterator::new(PacketIterator::new(ByteIterator::new(bus)))
            .map(|(_, ev)| *pipeline::downcast::<protocol::Event>(ev.unwrap()))
            .collect::<Vec<_>>();

        assert_eq!(
            transactions,
            vec![protocol::Event::Transaction(Transaction {
                token: Token {
                    token_type: TokenType::In,
                    address: 0,
                    endpoint: 0,
                },
                data: Some(Data {
                    pid: DataPID::Data0,
                    payload: vec![],
                }),
                handshake: HandShake::Ack,
            })]
        );
    }

    #[test]
    fn trace_is_written() {
        let out = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        struct Shared(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().write(buf)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut soc = Soc::default()
            .with_trace(Box::new(Shared(out.clone())))
            .unwrap();
        soc.send_packet(&token(TokenType::Setup, 0, 0)).unwrap();
        let text = String::from_utf8(out.borrow().clone()).unwrap();
        assert!(text.contains("$enddefinitions"));
        assert!(text.contains("usb_oe"));
        // 8333ps clock
        assert!(text.contains("#8333\n"));
    }
}
