use std::str::FromStr;

use crate::device::nrzi::STUFF_RUN;

/// Bus state for one bit period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    SE0,
    J,
    K,
    SE1,
}

impl Signal {
    /// `(j_not_k, se0)` as seen by the device.
    pub fn levels(self) -> (bool, bool) {
        match self {
            Signal::J => (true, false),
            Signal::K => (false, false),
            Signal::SE0 => (false, true),
            Signal::SE1 => (true, true),
        }
    }

    pub fn from_levels(j_not_k: bool, se0: bool) -> Self {
        match (j_not_k, se0) {
            (true, false) => Signal::J,
            (false, false) => Signal::K,
            (false, true) => Signal::SE0,
            (true, true) => Signal::SE1,
        }
    }
}

impl FromStr for Signal {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "J" | "j" => Signal::J,
            "K" | "k" => Signal::K,
            "0" | "SE0" | "se0" => Signal::SE0,
            "1" | "SE1" | "se1" => Signal::SE1,
            _ => anyhow::bail!("Unknown line state {:?}", s),
        })
    }
}

/// NRZI encodes `bytes` (sync byte included) from an idle J, stuffs a zero after six ones and
/// closes the packet with SE0 SE0 J.
pub fn encode(bytes: &[u8]) -> Vec<Signal> {
    let mut line = Vec::with_capacity(bytes.len() * 9 + 3);
    let mut level = Signal::J;
    let mut ones = 0;
    let toggle = |level: Signal| {
        if level == Signal::J {
            Signal::K
        } else {
            Signal::J
        }
    };

    for bit in bytes.iter().flat_map(|b| (0..8).map(move |i| (b >> i) & 1 == 1)) {
        if bit {
            ones += 1;
        } else {
            ones = 0;
            level = toggle(level);
        }
        line.push(level);
        if ones == STUFF_RUN {
            ones = 0;
            level = toggle(level);
            line.push(level);
        }
    }
    line.extend_from_slice(&[Signal::SE0, Signal::SE0, Signal::J]);
    line
}

/// Inverse of [`encode`]: decodes symbols up to the first SE0.
pub fn decode(line: &[Signal]) -> anyhow::Result<Vec<u8>> {
    let mut prev = Signal::J;
    let mut ones = 0;
    let mut bits = Vec::new();
    for &symbol in line {
        match symbol {
            Signal::SE0 => break,
            Signal::SE1 => anyhow::bail!("Unexpected bus state"),
            Signal::J | Signal::K => {}
        }
        if ones == STUFF_RUN {
            anyhow::ensure!(symbol != prev, "Bit stuffing error");
            ones = 0;
        } else if symbol == prev {
            ones += 1;
            bits.push(true);
        } else {
            ones = 0;
            bits.push(false);
        }
        prev = symbol;
    }
    anyhow::ensure!(
        bits.len() % 8 == 0,
        "Packet ends after {} bits, not on a byte boundary",
        bits.len()
    );
    Ok(bits
        .chunks(8)
        .map(|byte| {
            byte.iter()
                .enumerate()
                .fold(0, |acc, (i, &bit)| acc | (u8::from(bit) << i))
        })
        .collect())
}
