//! Full-speed USB device controller, simulated one clock cycle at a time.
//!
//! The controller recovers bits from the oversampled line, decodes token, data and handshake
//! packets, and answers from eight byte endpoint buffers living in an external memory. The CPU
//! side only sees a small register file (see [`regs`]).
//!
//! [`UsbDevice::step`] evaluates every combinational output from the current registers and the
//! inputs, then commits every register at once, as a clock edge would.

pub mod bit_sync;
pub mod crc;
pub mod engine;
pub mod nrzi;
pub mod pid;
pub mod regs;

use bit_sync::BitSync;
use engine::{EngineInputs, ProtocolEngine, State};
use nrzi::{NrziDecoder, NrziEncoder};
use regs::{RegBus, RegisterFile};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Inputs {
    /// Differential line, `true` being J.
    pub j_not_k: bool,
    pub se0: bool,
    /// Endpoint memory read data for the address presented on the previous cycle.
    pub mem_rdata: u8,
    pub reg: RegBus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Outputs {
    pub oe: bool,
    pub j_not_k: bool,
    pub se0: bool,
    /// Pull-up enable.
    pub attach: bool,
    pub mem_wen: bool,
    pub mem_ren: bool,
    /// 10 bit byte address.
    pub mem_addr: u16,
    pub mem_wdata: u8,
    pub reg_rdata: u32,
}

/// Internal signals of the last evaluated cycle, for waveform dumps.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Probe {
    pub sample_en: bool,
    pub bit_valid: bool,
    pub bit: bool,
}

#[derive(Debug, Clone)]
pub struct UsbDevice {
    bit_sync: BitSync,
    decoder: NrziDecoder,
    encoder: NrziEncoder,
    engine: ProtocolEngine,
    regs: RegisterFile,
    probe: Probe,
}

impl UsbDevice {
    pub fn new(oversample: u8) -> Self {
        Self {
            bit_sync: BitSync::new(oversample),
            decoder: NrziDecoder::default(),
            encoder: NrziEncoder::default(),
            engine: ProtocolEngine::new(),
            regs: RegisterFile::default(),
            probe: Probe::default(),
        }
    }

    pub fn oversample(&self) -> u8 {
        self.bit_sync.ratio()
    }

    pub fn state(&self) -> State {
        self.engine.state()
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn probe(&self) -> Probe {
        self.probe
    }

    /// Runs one clock cycle.
    pub fn step(&mut self, inputs: &Inputs) -> Outputs {
        let sample_en = self.bit_sync.sample_en();
        let decoded = self.decoder.eval(inputs.j_not_k, sample_en);
        let enc_inputs = self.engine.encoder_inputs(sample_en);
        let encoder = self.encoder.eval(&enc_inputs);
        let step = self.engine.eval(
            &EngineInputs {
                j_not_k: inputs.j_not_k,
                se0: inputs.se0,
                sample_en,
                decoded,
                encoder,
                mem_rdata: inputs.mem_rdata,
            },
            &self.regs,
        );

        let outputs = Outputs {
            oe: step.outputs.usb_oe,
            j_not_k: step.outputs.usb_j_not_k,
            se0: step.outputs.usb_se0,
            attach: self.regs.attach(),
            mem_wen: step.outputs.mem_wen,
            mem_ren: step.outputs.mem_ren,
            mem_addr: step.outputs.mem_addr,
            mem_wdata: step.outputs.mem_wdata,
            reg_rdata: self.regs.read(inputs.reg.addr),
        };

        let regs = self.regs.next(&inputs.reg, &step.update);
        if regs.endp_owner != self.regs.endp_owner {
            log::debug!(
                "ENDP_OWNER {:08x} -> {:08x}",
                self.regs.endp_owner,
                regs.endp_owner
            );
        }

        self.probe = Probe {
            sample_en,
            bit_valid: decoded.valid,
            bit: decoded.value,
        };
        self.bit_sync = self.bit_sync.next();
        self.decoder = self.decoder.next(inputs.j_not_k, sample_en);
        self.encoder = self.encoder.next(&enc_inputs);
        self.engine = step.next;
        self.regs = regs;
        outputs
    }
}

impl Default for UsbDevice {
    fn default() -> Self {
        Self::new(bit_sync::OVERSAMPLE)
    }
}
