use std::convert::TryFrom;

use anyhow::Result;

use super::byte::{self, Byte};
use super::types::{crc16, crc16_bytes, crc5, with_crc5, Data, DataPID, HandShake, Token, TokenType};
use crate::device::crc::{Crc16, Crc5};
use crate::device::nrzi::SYNC_MARKER;
use crate::device::pid::Pid;
use crate::pipeline::{self, Event, EventData, EventIterator, Pipeline};

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    SoF(u16),
    HandShake(HandShake),
    Token(Token),
    Data(Data),
}

impl Packet {
    pub fn pid(&self) -> Pid {
        match self {
            Packet::SoF(_) => Pid::Sof,
            Packet::HandShake(handshake) => handshake.pid(),
            Packet::Token(token) => token.token_type.pid(),
            Packet::Data(data) => data.pid.pid(),
        }
    }

    /// Wire bytes, sync byte and CRC included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![SYNC_MARKER, self.pid().byte()];
        match self {
            Packet::SoF(frm_num) => buf.extend_from_slice(&with_crc5(*frm_num)),
            Packet::Token(token) => buf.extend_from_slice(&token.fields()),
            Packet::Data(data) => {
                buf.extend_from_slice(&data.payload);
                buf.extend_from_slice(&crc16_bytes(&data.payload));
            }
            Packet::HandShake(_) => {}
        }
        buf
    }
}

impl TryFrom<&[u8]> for Packet {
    type Error = anyhow::Error;
    fn try_from(buf: &[u8]) -> Result<Self> {
        anyhow::ensure!(buf.first() == Some(&SYNC_MARKER), "Invalid sync byte");

        match &buf[1..] {
            &[0xA5, lsb, msb] => {
                anyhow::ensure!(crc5(&buf[2..]) == Crc5::RESIDUAL, "Crc error");

                let frm_num = ((u16::from(msb) << 8) | u16::from(lsb)) & 0x7FF;
                Ok(Packet::SoF(frm_num))
            }
            &[pid @ 0xE1, lsb, msb] | &[pid @ 0x69, lsb, msb] | &[pid @ 0x2D, lsb, msb] => {
                anyhow::ensure!(crc5(&[lsb, msb]) == Crc5::RESIDUAL, "Crc error");

                Ok(Packet::Token(Token {
                    token_type: match Pid::from_byte(pid) {
                        Some(Pid::Out) => TokenType::Out,
                        Some(Pid::In) => TokenType::In,
                        _ => TokenType::Setup,
                    },
                    address: lsb & 0x7F,
                    endpoint: ((msb & 0x7) << 1) | (lsb >> 7),
                }))
            }

            // the extra 2 underscores are crc16 place holder
            &[pid @ 0xC3, ref data @ .., _, _] | &[pid @ 0x4B, ref data @ .., _, _] => {
                anyhow::ensure!(crc16(&buf[2..]) == Crc16::RESIDUAL, "CRC Error");
                Ok(Packet::Data(Data {
                    pid: if pid == 0xC3 {
                        DataPID::Data0
                    } else {
                        DataPID::Data1
                    },
                    payload: data.to_vec(),
                }))
            }
            &[0xD2] => Ok(Packet::HandShake(HandShake::Ack)),
            &[0x5A] => Ok(Packet::HandShake(HandShake::NAck)),
            &[0x1E] => Ok(Packet::HandShake(HandShake::Stall)),

            _ => anyhow::bail!("Unknown packet {:x?}", buf),
        }
    }
}

pub struct PacketIterator<T> {
    it: T,
}

impl<T> Iterator for PacketIterator<T>
where
    T: Iterator<Item = Event>,
{
    type Item = Event;
    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = Vec::new();
        let mut start = None;

        let out: (_, Result<Box<dyn EventData>>) = loop {
            let (ts, event) = match self.it.next()? {
                (ts, Ok(ev)) => (ts, ev),
                (ts, Err(e)) => return Some((ts, Err(e))),
            };
            let byte = *pipeline::downcast(event);
            match byte {
                Byte::Idle => {}
                Byte::Byte(b) => {
                    start.get_or_insert(ts);
                    buf.push(b);
                }
                Byte::Eop => {
                    break (
                        start.unwrap_or(ts),
                        Packet::try_from(&buf as &[u8]).map(|v| Box::new(v) as Box<dyn EventData>),
                    );
                }
            }
        };
        Some(out)
    }
}

impl<T> PacketIterator<T> {
    pub fn new(input: T) -> Self {
        Self { it: input }
    }
}
impl<T: 'static + Iterator<Item = Event>> EventIterator for PacketIterator<T> {
    fn into_iterator(self: Box<Self>) -> Box<dyn Iterator<Item = Event>> {
        self
    }
    fn event_type(&self) -> std::any::TypeId {
        std::any::TypeId::of::<Packet>()
    }
    fn event_type_name(&self) -> &'static str {
        std::any::type_name::<Packet>()
    }
}

pub fn build(pipeline: &mut Pipeline, args: &[String]) {
    use clap::{Arg, SubCommand};

    let arg_matches = SubCommand::with_name("usb::packet")
        .setting(clap::AppSettings::NoBinaryName)
        .arg(Arg::from_usage(
            "-v, --verbose 'set to print events to stdout.'",
        ))
        .get_matches_from(args);

    pipeline::ensure_upstream::<Byte>(pipeline, byte::build);
    let it = pipeline::take_upstream(pipeline, "usb::packet");
    let node = Box::new(PacketIterator::new(it));
    pipeline.push(crate::sink::verbose(node, arg_matches.is_present("verbose")));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bytes_decode_back() {
        let setup = Packet::Token(Token {
            token_type: TokenType::Setup,
            address: 5,
            endpoint: 0,
        });
        assert_eq!(setup.to_bytes(), vec![0x80, 0x2D, 0x05, 0xD0]);
        let bytes = setup.to_bytes();
        assert_eq!(Packet::try_from(&bytes as &[u8]).unwrap(), setup);
    }

    #[test]
    fn data_packet_carries_crc16() {
        let data = Packet::Data(Data {
            pid: DataPID::Data0,
            payload: vec![0, 1, 2, 3],
        });
        assert_eq!(
            data.to_bytes(),
            vec![0x80, 0xC3, 0x00, 0x01, 0x02, 0x03, 0xEF, 0x7A]
        );
        let zlp = Packet::Data(Data {
            pid: DataPID::Data1,
            payload: vec![],
        });
        assert_eq!(zlp.to_bytes(), vec![0x80, 0x4B, 0x00, 0x00]);
        let bytes = zlp.to_bytes();
        assert_eq!(Packet::try_from(&bytes as &[u8]).unwrap(), zlp);
    }

    #[test]
    fn corrupted_packets_are_rejected() {
        assert!(Packet::try_from(&[0x80u8, 0x2D, 0x05, 0xD1] as &[u8]).is_err());
        assert!(Packet::try_from(&[0x80u8, 0xC3, 0x00, 0x01, 0x02, 0x03, 0xEF, 0x7B] as &[u8]).is_err());
        assert!(Packet::try_from(&[0x00u8, 0xD2] as &[u8]).is_err());
        assert!(Packet::try_from(&[0x80u8, 0x96] as &[u8]).is_err());
        assert!(Packet::try_from(&[] as &[u8]).is_err());
    }

    #[test]
    fn sof_frame_number() {
        let sof = Packet::SoF(0x5A3);
        let bytes = sof.to_bytes();
        assert_eq!(Packet::try_from(&bytes as &[u8]).unwrap(), sof);
    }
}
