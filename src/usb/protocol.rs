use super::packet::{self, Packet};
use super::types::{Data, HandShake, Token};
use crate::pipeline::{self, Event as PipeEvent, EventData, EventIterator, Pipeline};
use anyhow::Result;

#[derive(Debug, PartialEq)]
pub enum Event {
    Sof(u16),
    Transaction(Transaction),
    /// A token that never got a handshake: the device dropped it or timed out.
    Unanswered(Token),
}

#[derive(PartialEq, Debug)]
pub enum TransactionState {
    Idle,
    Token(Token),
    Data { token: Token, data: Option<Data> },
}

impl TransactionState {
    fn pending(&self) -> Option<Token> {
        match *self {
            TransactionState::Idle => None,
            TransactionState::Token(token) | TransactionState::Data { token, .. } => Some(token),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Transaction {
    pub token: Token,
    pub data: Option<Data>,
    pub handshake: HandShake,
}

pub struct ProtocolIterator<T> {
    it: T,
    transaction_state: TransactionState,
    last_ts: f64,
}
impl<T> Iterator for ProtocolIterator<T>
where
    T: Iterator<Item = PipeEvent>,
{
    type Item = PipeEvent;
    fn next(&mut self) -> Option<Self::Item> {
        let out: (_, Result<Box<dyn EventData>>) = loop {
            let (ts, event) = match self.it.next() {
                Some((ts, Ok(ev))) => (ts, ev),
                Some((ts, Err(e))) => return Some((ts, Err(e))),
                None => {
                    let token = self.transaction_state.pending()?;
                    self.transaction_state = TransactionState::Idle;
                    break (self.last_ts, Ok(Box::new(Event::Unanswered(token))));
                }
            };
            self.last_ts = ts;
            let event = *pipeline::downcast(event);
            match event {
                Packet::SoF(frm_num) => break (ts, Ok(Box::new(Event::Sof(frm_num)))),
                Packet::Token(token) => {
                    let pending = self.transaction_state.pending();
                    self.transaction_state = TransactionState::Token(token);
                    if let Some(pending) = pending {
                        break (ts, Ok(Box::new(Event::Unanswered(pending))));
                    }
                }
                Packet::Data(data) => match self.transaction_state {
                    TransactionState::Token(token) => {
                        self.transaction_state = TransactionState::Data {
                            token,
                            data: Some(data),
                        };
                    }
                    _ => break (ts, Err(anyhow::anyhow!("Unexpected data packet"))),
                },
                Packet::HandShake(handshake) => {
                    let (token, data) = match self.transaction_state {
                        TransactionState::Token(token) => (token, None),
                        TransactionState::Data {
                            token,
                            ref mut data,
                        } => (token, data.take()),
                        _ => break (ts, Err(anyhow::anyhow!("Unexpected handshake packet"))),
                    };
                    self.transaction_state = TransactionState::Idle;
                    break (
                        ts,
                        Ok(Box::new(Event::Transaction(Transaction {
                            token,
                            data,
                            handshake,
                        }))),
                    );
                }
            }
        };

        Some(out)
    }
}

impl<T> ProtocolIterator<T>
where
    T: Iterator<Item = PipeEvent>,
{
    pub fn new(input: T) -> Self {
        Self {
            it: input,
            transaction_state: TransactionState::Idle,
            last_ts: 0.,
        }
    }
}

impl<T: 'static + Iterator<Item = PipeEvent>> EventIterator for ProtocolIterator<T> {
    fn into_iterator(self: Box<Self>) -> Box<dyn Iterator<Item = PipeEvent>> {
        self
    }
    fn event_type(&self) -> std::any::TypeId {
        std::any::TypeId::of::<Event>()
    }
    fn event_type_name(&self) -> &'static str {
        std::any::type_name::<Event>()
    }
}

pub fn build(pipeline: &mut Pipeline, args: &[String]) {
    use clap::{Arg, SubCommand};

    let arg_matches = SubCommand::with_name("usb::protocol")
        .setting(clap::AppSettings::NoBinaryName)
        .arg(Arg::from_usage(
            "-v, --verbose 'set to print events to stdout.'",
        ))
        .get_matches_from(args);

    pipeline::ensure_upstream::<Packet>(pipeline, packet::build);
    let it = pipeline::take_upstream(pipeline, "usb::protocol");
    let node = Box::new(ProtocolIterator::new(it));
    pipeline.push(crate::sink::verbose(node, arg_matches.is_present("verbose")));
}
