//! NRZI line coding with bit stuffing.
//!
//! A `1` is sent as "no transition" and a `0` as a transition. After six consecutive `1`s the
//! transmitter inserts a `0` so the receiver's clock recovery always sees an edge; the receiver
//! drops that inserted bit.

/// Number of consecutive ones after which a stuffed zero is inserted.
pub const STUFF_RUN: u8 = 6;
/// Marker loaded into the encoder on restart: `0000_0001` sent lsb first is the SYNC pattern.
pub const SYNC_MARKER: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedBit {
    pub value: bool,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NrziDecoder {
    prev: bool,
    ones: u8,
}

impl NrziDecoder {
    /// `valid` is dropped on the sample following six ones: that bit is a stuffed one.
    pub fn eval(&self, bit: bool, bit_en: bool) -> DecodedBit {
        DecodedBit {
            value: !(self.prev ^ bit),
            valid: bit_en && self.ones != STUFF_RUN,
        }
    }

    pub fn next(&self, bit: bool, bit_en: bool) -> Self {
        if !bit_en {
            return *self;
        }
        let value = !(self.prev ^ bit);
        Self {
            prev: bit,
            ones: if self.ones == STUFF_RUN || !value {
                0
            } else {
                self.ones + 1
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncoderInputs {
    pub byte: u8,
    pub restart: bool,
    pub enc_en: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncoderOutputs {
    /// Line level to drive, `true` being J.
    pub bit: bool,
    /// The current byte is fully shifted out and `byte` is latched on this cycle.
    pub reload: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NrziEncoder {
    shift: u8,
    shift_cntr: u8,
    ones: u8,
    prev: bool,
}

impl NrziEncoder {
    fn six_ones(&self) -> bool {
        self.ones == STUFF_RUN
    }

    fn data_bit(&self) -> bool {
        !self.six_ones() && (self.shift & 1) != 0
    }

    pub fn eval(&self, inputs: &EncoderInputs) -> EncoderOutputs {
        EncoderOutputs {
            bit: if self.data_bit() { self.prev } else { !self.prev },
            reload: !inputs.restart && inputs.enc_en && !self.six_ones() && self.shift_cntr == 7,
        }
    }

    pub fn next(&self, inputs: &EncoderInputs) -> Self {
        let mut next = *self;
        if inputs.enc_en {
            next.ones = if self.six_ones() || (self.shift & 1) == 0 {
                0
            } else {
                self.ones + 1
            };
        }

        if inputs.restart {
            // idle state is J
            next.shift = SYNC_MARKER;
            next.shift_cntr = 0;
            next.prev = true;
        } else if inputs.enc_en {
            next.prev = self.eval(inputs).bit;
            // a stuffed bit is not one of the eight payload bits
            if !self.six_ones() {
                next.shift_cntr = (self.shift_cntr + 1) & 0x7;
                next.shift = if self.shift_cntr == 7 {
                    inputs.byte
                } else {
                    self.shift >> 1
                };
            }
        }
        next
    }
}
