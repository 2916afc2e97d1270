use std::collections::VecDeque;

use super::signal::Signal;
use crate::device::nrzi::STUFF_RUN;
use crate::pipeline::{self, Event, EventIterator, Pipeline};

/// Full-speed bit period in seconds.
pub const BIT_LEN: f64 = 1. / 12_000_000.;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Byte {
    Idle,
    Byte(u8),
    Eop,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum State {
    Idle,
    EopStart,
    Receiving,
}

/// Rebuilds bytes from bus transitions: each event is the bus state from its timestamp until the
/// next event.
pub struct ByteIterator<T> {
    it: T,
    current: Option<(f64, Signal)>,

    state: State,
    counter: u16,
    shift_reg: u16,
    consecutive_ones: u8,

    ev_queue: VecDeque<Event>,
}

impl<T> ByteIterator<T> {
    fn push_bits(&mut self, ulen: u64) {
        let consecutive_ones = (ulen - 1) as u16;
        let bits = if self.consecutive_ones == STUFF_RUN {
            // the transition is a stuffed bit
            ulen - 1
        } else {
            ulen
        } as u16;

        self.counter += bits;
        self.shift_reg >>= bits;
        if consecutive_ones != 0 {
            let mask = (1 << consecutive_ones) - 1;
            self.shift_reg |= mask << (16 - consecutive_ones);
        }
        self.consecutive_ones = consecutive_ones as u8;
    }

    fn framing_error(&mut self, ts: f64, what: &str) {
        self.state = State::Idle;
        self.ev_queue
            .push_back((ts, Err(anyhow::anyhow!("Framing error: {}", what))));
    }

    /// `sig` held for `ulen` bit periods from `ts`.
    fn run(&mut self, ts: f64, sig: Signal, ulen: u64) {
        if sig == Signal::SE1 {
            self.ev_queue
                .push_back((ts, Err(anyhow::anyhow!("Unexpected bus state"))));
            return;
        }

        match self.state {
            State::Idle => {
                // a packet starts with the first K of SYNC
                if sig == Signal::K && ulen <= u64::from(STUFF_RUN) {
                    self.state = State::Receiving;
                    self.counter = 0;
                    self.shift_reg = 0;
                    self.consecutive_ones = 0;
                    self.push_bits(ulen);
                }
            }
            State::Receiving => match sig {
                Signal::SE0 if ulen == 2 => {
                    if self.counter != 0 {
                        self.framing_error(ts, "packet ends on a partial byte");
                    } else {
                        self.state = State::EopStart;
                    }
                }
                Signal::J | Signal::K if ulen <= u64::from(STUFF_RUN) + 1 => self.push_bits(ulen),
                _ => self.framing_error(ts, "bit stuffing violation"),
            },
            State::EopStart => {
                if sig == Signal::J {
                    self.ev_queue
                        .push_back((ts - 2. * BIT_LEN, Ok(Box::new(Byte::Eop))));
                    self.state = State::Idle;
                    if ulen > 1 {
                        self.ev_queue
                            .push_back((ts + BIT_LEN, Ok(Box::new(Byte::Idle))));
                    }
                } else {
                    self.framing_error(ts, "no J after SE0");
                }
            }
        }

        if self.counter >= 8 {
            self.ev_queue.push_back((
                ts + ulen as f64 * BIT_LEN,
                Ok(Box::new(Byte::Byte(
                    ((self.shift_reg >> (16 - self.counter)) & 0xFF) as u8,
                ))),
            ));
            self.counter -= 8;
        }
    }
}

impl<T> Iterator for ByteIterator<T>
where
    T: Iterator<Item = Event>,
{
    type Item = Event;
    fn next(&mut self) -> Option<Self::Item> {
        while self.ev_queue.is_empty() {
            let (ts, sig) = match self.it.next()? {
                (ts, Ok(ev)) => (ts, *pipeline::downcast::<Signal>(ev)),
                (ts, Err(e)) => return Some((ts, Err(e))),
            };

            if let Some((start, prev)) = self.current.replace((ts, sig)) {
                let ulen = ((ts - start) / BIT_LEN).round() as u64;
                if ulen != 0 {
                    self.run(start, prev, ulen);
                }
            }
        }
        self.ev_queue.pop_front()
    }
}

impl<T> ByteIterator<T> {
    pub fn new(input: T) -> Self {
        Self {
            it: input,
            current: None,
            state: State::Idle,
            counter: 0,
            shift_reg: 0,
            consecutive_ones: 0,
            ev_queue: VecDeque::new(),
        }
    }
}

impl<T: 'static + Iterator<Item = Event>> EventIterator for ByteIterator<T> {
    fn into_iterator(self: Box<Self>) -> Box<dyn Iterator<Item = Event>> {
        self
    }
    fn event_type(&self) -> std::any::TypeId {
        std::any::TypeId::of::<Byte>()
    }
    fn event_type_name(&self) -> &'static str {
        std::any::type_name::<Byte>()
    }
}

pub fn build(pipeline: &mut Pipeline, args: &[String]) {
    use clap::{Arg, SubCommand};

    let arg_matches = SubCommand::with_name("usb::byte")
        .setting(clap::AppSettings::NoBinaryName)
        .arg(Arg::from_usage(
            "-v, --verbose 'set to print events to stdout.'",
        ))
        .get_matches_from(args);

    pipeline::ensure_upstream::<Signal>(pipeline, crate::soc::build);
    let it = pipeline::take_upstream(pipeline, "usb::byte");
    let node = Box::new(ByteIterator::new(it));
    pipeline.push(crate::sink::verbose(node, arg_matches.is_present("verbose")));
}
