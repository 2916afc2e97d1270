//! Link layer state machine.
//!
//! The engine watches decoded bits, recognises tokens addressed to the device, acknowledges OUT
//! data, answers IN tokens from the endpoint buffers and hands buffers back to the CPU by clearing
//! their ownership bit. Every method takes `&self`: [`ProtocolEngine::eval`] computes the outputs
//! of the current cycle together with the registers of the next one.

use super::crc::{Crc16, Crc5};
use super::nrzi::{DecodedBit, EncoderInputs, EncoderOutputs};
use super::pid::Pid;
use super::regs::{Direction, EndpointId, EngineUpdate, RegisterFile};

/// Largest payload an endpoint buffer holds.
pub const MAX_PACKET: usize = 8;

/// `KJKJKJKK` as sampled, oldest sample in bit 7.
const SYNC_SAMPLES: u8 = 0b0101_0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    WaitSync,
    WaitPid,
    WaitAddrEndp,
    WaitCrc5,
    WaitFrameNbr,
    WaitTokEop,
    WaitData,
    WaitHandEop,
    WaitTx0,
    WaitTx1,
    TxSync,
    TxPid,
    TxWaitAckNak,
    TxData,
    TxCrc0,
    TxCrc1,
    TxCrc2,
    TxEop0,
    TxEop1,
    TxEop2,
}

impl State {
    pub fn is_transmitting(self) -> bool {
        match self {
            State::TxPid
            | State::TxWaitAckNak
            | State::TxData
            | State::TxCrc0
            | State::TxCrc1
            | State::TxCrc2
            | State::TxEop0
            | State::TxEop1
            | State::TxEop2 => true,
            _ => false,
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::WaitSync
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineInputs {
    /// Raw line levels, used for SYNC and EOP detection.
    pub j_not_k: bool,
    pub se0: bool,
    pub sample_en: bool,
    pub decoded: DecodedBit,
    pub encoder: EncoderOutputs,
    pub mem_rdata: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineOutputs {
    pub usb_oe: bool,
    pub usb_j_not_k: bool,
    pub usb_se0: bool,
    pub mem_wen: bool,
    pub mem_ren: bool,
    pub mem_addr: u16,
    pub mem_wdata: u8,
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub next: ProtocolEngine,
    pub outputs: EngineOutputs,
    pub update: EngineUpdate,
}

/// OUT payload received in the last DATA packet, written to the endpoint buffer once the packet
/// is known to be good.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Commit {
    endpoint: u8,
    idx: u8,
    len: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolEngine {
    state: State,

    j_not_k_shift: u8,
    se0_shift: u8,
    dec_shift: u32,
    dec_bit_cntr: u8,

    rx_pid: Option<Pid>,
    token_addr: u8,
    token_endp: u8,
    token_valid: bool,

    crc5: Crc5,
    crc5_en: bool,
    crc16: Crc16,
    crc16_en: bool,
    crc16_pass: bool,
    data_bit_cntr: u16,
    rx_buf: [u8; MAX_PACKET],
    commit: Commit,
    /// Ownership bit handed back once the staged payload is in memory.
    commit_clr: u32,
    owner_clr: u32,

    tx_pid: Option<Pid>,
    tx_len: u8,
    tx_idx: u8,
    mem_ren_p: bool,
    tx_data_mem: u8,
    tx_crc_shift: u8,
    tx_crc_shift_cntr: u8,
    crc16_tx: Crc16,
}

impl ProtocolEngine {
    pub fn new() -> Self {
        Self {
            tx_crc_shift_cntr: 8,
            ..Default::default()
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn token_valid(&self) -> bool {
        self.token_valid
    }

    /// Address and endpoint of the last token.
    pub fn token(&self) -> (u8, u8) {
        (self.token_addr, self.token_endp)
    }

    pub fn rx_pid(&self) -> Option<Pid> {
        self.rx_pid
    }

    fn tx_byte(&self) -> u8 {
        match self.state {
            State::TxData => self.tx_data_mem,
            State::TxCrc0 => self.crc16_tx.tx_value() as u8,
            State::TxCrc1 => (self.crc16_tx.tx_value() >> 8) as u8,
            _ => self.tx_pid.map_or(0, Pid::byte),
        }
    }

    /// Encoder controls only depend on registered state.
    pub fn encoder_inputs(&self, sample_en: bool) -> EncoderInputs {
        EncoderInputs {
            byte: self.tx_byte(),
            restart: self.state == State::TxSync,
            enc_en: sample_en,
        }
    }

    /// Samples t-3 and t-2 are SE0, t-1 is J.
    fn eop(&self) -> bool {
        self.se0_shift & 0b0110 == 0b0110 && self.j_not_k_shift & 1 == 1
    }

    fn sync(&self) -> bool {
        self.j_not_k_shift == SYNC_SAMPLES
    }

    fn outputs(&self, inputs: &EngineInputs) -> EngineOutputs {
        let mem_ren = inputs.sample_en
            && inputs.encoder.reload
            && (self.state == State::TxPid || self.state == State::TxData);
        let mem_wen = self.commit.idx < self.commit.len;

        let mem_addr = if mem_wen {
            EndpointId::new(Direction::Out, self.commit.endpoint).buffer_addr(self.commit.idx)
        } else {
            EndpointId::new(Direction::In, self.token_endp).buffer_addr(self.tx_idx)
        };

        EngineOutputs {
            usb_oe: self.state.is_transmitting(),
            usb_j_not_k: match self.state {
                State::TxEop0 | State::TxEop1 => false,
                State::TxEop2 => true,
                _ => inputs.encoder.bit,
            },
            usb_se0: self.state == State::TxEop0 || self.state == State::TxEop1,
            mem_wen,
            mem_ren,
            mem_addr,
            mem_wdata: self.rx_buf[usize::from(self.commit.idx) % MAX_PACKET],
        }
    }

    pub fn eval(&self, inputs: &EngineInputs, regs: &RegisterFile) -> Step {
        let outputs = self.outputs(inputs);
        let mut next = self.clone();
        let mut update = EngineUpdate::default();
        let bit_en = inputs.decoded.valid;
        let bit = inputs.decoded.value;
        let eop = self.eop();

        if inputs.sample_en {
            next.j_not_k_shift = (self.j_not_k_shift << 1) | inputs.j_not_k as u8;
            next.se0_shift = ((self.se0_shift << 1) | inputs.se0 as u8) & 0xF;
        }
        if bit_en {
            next.dec_shift = (self.dec_shift >> 1) | (u32::from(bit) << 31);
            next.dec_bit_cntr = (self.dec_bit_cntr + 1) & 0x1F;
        }

        // The clear mask is a one cycle pulse.
        next.owner_clr = 0;
        if outputs.mem_wen {
            next.commit.idx += 1;
            if next.commit.idx == self.commit.len {
                next.owner_clr = self.commit_clr;
                next.commit_clr = 0;
            }
        }

        let crc_reset = self.state == State::WaitSync;
        next.crc5 = self
            .crc5
            .next(self.dec_shift >> 31 == 1, bit_en && self.crc5_en, crc_reset);
        next.crc16 = self
            .crc16
            .next(self.dec_shift >> 31 == 1, bit_en && self.crc16_en, crc_reset);

        self.receive(inputs, regs, eop, &mut next, &mut update);
        self.transmit(inputs, &mut next);

        next.mem_ren_p = outputs.mem_ren;
        if self.mem_ren_p {
            next.tx_data_mem = inputs.mem_rdata;
        }

        if inputs.encoder.reload && self.state == State::TxData {
            next.tx_crc_shift = self.tx_byte();
            next.tx_crc_shift_cntr = 0;
        } else if self.tx_crc_shift_cntr < 8 {
            next.tx_crc_shift = self.tx_crc_shift >> 1;
            next.tx_crc_shift_cntr = self.tx_crc_shift_cntr + 1;
        }
        next.crc16_tx = self.crc16_tx.next(
            self.tx_crc_shift & 1 == 1,
            self.tx_crc_shift_cntr < 8,
            self.state == State::TxSync,
        );

        update.owner_clr = self.owner_clr;
        if next.state != self.state {
            log::trace!("{:?} -> {:?}", self.state, next.state);
        }

        Step {
            next,
            outputs,
            update,
        }
    }

    fn receive(
        &self,
        inputs: &EngineInputs,
        regs: &RegisterFile,
        eop: bool,
        next: &mut Self,
        update: &mut EngineUpdate,
    ) {
        let bit_en = inputs.decoded.valid;
        match self.state {
            State::WaitSync => {
                if bit_en && self.sync() {
                    next.dec_bit_cntr = 1;
                    next.state = State::WaitPid;
                }
            }
            State::WaitPid => {
                if bit_en && self.dec_bit_cntr == 8 {
                    let code = (self.dec_shift >> 24) as u8;
                    let pid = Pid::from_byte(code);
                    next.rx_pid = pid;
                    next.state = match pid {
                        Some(Pid::Out) | Some(Pid::In) | Some(Pid::Setup) => {
                            next.dec_bit_cntr = 1;
                            next.crc5_en = true;
                            State::WaitAddrEndp
                        }
                        Some(Pid::Sof) => {
                            next.dec_bit_cntr = 1;
                            next.crc5_en = true;
                            State::WaitFrameNbr
                        }
                        Some(Pid::Data0) | Some(Pid::Data1) => {
                            next.data_bit_cntr = 1;
                            next.crc16_en = true;
                            next.crc16_pass = false;
                            State::WaitData
                        }
                        Some(Pid::Ack) | Some(Pid::Nak) => State::WaitHandEop,
                        Some(Pid::Stall) | None => State::WaitSync,
                    };
                }
            }
            State::WaitFrameNbr => {
                // the CRC5 runs on until EOP
                if bit_en && self.dec_bit_cntr == 11 {
                    next.state = State::WaitTokEop;
                }
            }
            State::WaitAddrEndp => {
                if bit_en && self.dec_bit_cntr == 11 {
                    next.token_addr = ((self.dec_shift >> 21) & 0x7F) as u8;
                    next.token_endp = ((self.dec_shift >> 28) & 0xF) as u8;
                    next.dec_bit_cntr = 1;
                    next.state = State::WaitCrc5;
                }
            }
            State::WaitCrc5 => {
                if bit_en && self.dec_bit_cntr == 5 {
                    next.crc5_en = false;
                    next.state = State::WaitTokEop;
                }
            }
            State::WaitTokEop => {
                if bit_en && eop {
                    next.state = State::WaitSync;
                    next.token_valid = false;
                    if !self.crc5.is_residual() {
                        log::debug!("dropping token, CRC5 {:05b}", self.crc5.value());
                    } else if self.rx_pid != Some(Pid::Sof) {
                        self.accept_token(regs, next);
                    }
                }
            }
            State::WaitData => {
                if bit_en {
                    next.data_bit_cntr = (self.data_bit_cntr + 1) & 0x3FF;
                    if self.data_bit_cntr & 0x7 == 0 {
                        let byte = (self.dec_shift >> 24) as u8;
                        let idx = ((self.data_bit_cntr >> 3) & 0xF).wrapping_sub(1) & 0xF;
                        if let Some(slot) = next.rx_buf.get_mut(usize::from(idx)) {
                            *slot = byte;
                        }
                    }
                    if self.data_bit_cntr & 0x7 == 1 {
                        next.crc16_pass = self.crc16.is_residual();
                    }
                    if eop {
                        next.crc16_en = false;
                        if self.token_valid && self.crc16_pass {
                            self.accept_data(regs, next, update);
                        } else {
                            log::debug!(
                                "dropping DATA packet for endpoint {}, CRC16 {:04x}",
                                self.token_endp,
                                self.crc16.value()
                            );
                            next.state = State::WaitSync;
                        }
                    }
                }
            }
            State::WaitHandEop => {
                if bit_en && eop {
                    if self.rx_pid == Some(Pid::Ack) {
                        let ep = EndpointId::new(Direction::In, self.token_endp);
                        log::debug!("IN {} acknowledged", self.token_endp);
                        next.owner_clr = ep.mask();
                    }
                    next.state = State::WaitSync;
                }
            }
            _ => {}
        }
    }

    fn accept_token(&self, regs: &RegisterFile, next: &mut Self) {
        if regs.addr != self.token_addr {
            return;
        }
        next.token_valid = true;
        if let Some(pid) = self.rx_pid {
            log::debug!("{} token for endpoint {}", pid, self.token_endp);
        }
        if self.rx_pid == Some(Pid::In) {
            let ep = EndpointId::new(Direction::In, self.token_endp);
            next.state = State::WaitTx0;
            next.tx_pid = if regs.owns(ep) {
                next.tx_idx = 0;
                next.tx_len = regs.in_size.get(self.token_endp);
                Some(if regs.toggle(ep) { Pid::Data1 } else { Pid::Data0 })
            } else {
                Some(Pid::Nak)
            };
        }
    }

    fn accept_data(&self, regs: &RegisterFile, next: &mut Self, update: &mut EngineUpdate) {
        let ep = EndpointId::new(Direction::Out, self.token_endp);
        next.state = State::WaitTx0;
        if !regs.owns(ep) {
            next.tx_pid = Some(Pid::Nak);
            return;
        }
        next.tx_pid = Some(Pid::Ack);

        // bytes seen so far minus the two CRC bytes
        let size = ((self.data_bit_cntr >> 3) as u8).wrapping_sub(2) & 0xF;
        update.out_size = Some((self.token_endp, size));
        log::debug!("OUT {} received {} bytes", self.token_endp, size);

        let len = std::cmp::min(usize::from(size), MAX_PACKET) as u8;
        next.commit = Commit {
            endpoint: self.token_endp,
            idx: 0,
            len,
        };
        if len == 0 {
            next.owner_clr = ep.mask();
        } else {
            next.commit_clr = ep.mask();
        }
    }

    fn transmit(&self, inputs: &EngineInputs, next: &mut Self) {
        let reload = inputs.sample_en && inputs.encoder.reload;
        if !inputs.sample_en {
            return;
        }
        match self.state {
            State::WaitTx0 => next.state = State::WaitTx1,
            State::WaitTx1 => next.state = State::TxSync,
            State::TxSync => next.state = State::TxPid,
            State::TxPid => {
                if reload {
                    next.state = match self.tx_pid {
                        Some(Pid::Data0) | Some(Pid::Data1) if self.tx_len == 0 => State::TxCrc0,
                        Some(Pid::Data0) | Some(Pid::Data1) => {
                            next.tx_idx = (self.tx_idx + 1) & 0x7F;
                            State::TxData
                        }
                        _ => State::TxWaitAckNak,
                    };
                }
            }
            State::TxWaitAckNak => {
                if reload {
                    next.state = State::TxEop0;
                }
            }
            State::TxData => {
                if reload {
                    next.tx_idx = (self.tx_idx + 1) & 0x7F;
                    if self.tx_idx == self.tx_len {
                        next.state = State::TxCrc0;
                    }
                }
            }
            State::TxCrc0 => {
                if reload {
                    next.state = State::TxCrc1;
                }
            }
            State::TxCrc1 => {
                if reload {
                    next.state = State::TxCrc2;
                }
            }
            State::TxCrc2 => {
                if reload {
                    next.state = State::TxEop0;
                }
            }
            State::TxEop0 => next.state = State::TxEop1,
            State::TxEop1 => next.state = State::TxEop2,
            State::TxEop2 => next.state = State::WaitSync,
            _ => {}
        }
    }
}
