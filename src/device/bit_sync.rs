/// Cycles per bit period at full-speed when clocked at 120MHz.
pub const OVERSAMPLE: u8 = 10;

/// Free running counter giving one `sample_en` pulse per bit period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitSync {
    ratio: u8,
    counter: u8,
}

impl BitSync {
    /// A ratio of zero is taken as one.
    pub fn new(ratio: u8) -> Self {
        Self {
            ratio: ratio.max(1),
            counter: 0,
        }
    }

    pub fn ratio(&self) -> u8 {
        self.ratio
    }

    pub fn sample_en(&self) -> bool {
        self.counter == 0
    }

    pub fn next(&self) -> Self {
        Self {
            counter: if self.counter + 1 == self.ratio {
                0
            } else {
                self.counter + 1
            },
            ..*self
        }
    }
}

impl Default for BitSync {
    fn default() -> Self {
        Self::new(OVERSAMPLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_pulse_per_bit_period() {
        let mut sync = BitSync::default();
        let pulses: Vec<usize> = (0..35)
            .filter(|_| {
                let en = sync.sample_en();
                sync = sync.next();
                en
            })
            .collect();
        assert_eq!(pulses, vec![0, 10, 20, 30]);
    }

    #[test]
    fn ratio_of_one_samples_every_cycle() {
        let sync = BitSync::new(1);
        assert!(sync.sample_en());
        assert!(sync.next().sample_en());
    }

    #[test]
    fn zero_ratio_is_clamped() {
        let sync = BitSync::new(0);
        assert_eq!(sync.ratio(), 1);
        assert!(sync.sample_en());
        assert!(sync.next().sample_en());
        assert!(sync.next().next().sample_en());
    }
}
