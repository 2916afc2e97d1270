//! Scenario scripts, one command per line.
//!
//! ```text
//! # host packets
//! setup 0 0
//! data0 80 06 00 01 00 00 40 00
//! in 0 0
//! ack
//! sof 0x123
//! # raw line symbols: J K 0 (SE0) 1 (SE1)
//! lines K J K J K J K K 0 0 J
//! idle 16
//! listen 32
//! # CPU side
//! reg write ENDP_OWNER 0x00040002
//! reg read OUT_SIZE_0_7
//! ram write 0x90 de ad be ef
//! ram read 8 3
//! rom read 0x40
//! # firmware helpers
//! owner set in 2
//! owner get out 1
//! toggle clear in 2
//! size in 2 5
//! size out 1
//! copy in 2 de ad be ef 00
//! copy out 1 3
//! ```
//!
//! Numbers are decimal or `0x` prefixed hex; payload bytes are always hex.

use std::io::Read;

use anyhow::Context;
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1, take_while_m_n},
    character::complete::{digit1, hex_digit1, space1},
    combinator::{all_consuming, map, map_res, opt, value, verify},
    multi::separated_list,
    sequence::{pair, preceded, tuple},
    IResult,
};
use thiserror::Error;

use crate::device::regs::{Direction, EndpointId, Reg};
use crate::pipeline::{Event, EventData, EventIterator, Pipeline};
use crate::usb::packet::Packet;
use crate::usb::signal::Signal;
use crate::usb::types::{Data, DataPID, HandShake, Token, TokenType};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Host packet, sent with its SYNC and EOP.
    Packet(Packet),
    /// Raw symbols, one bit period each.
    Line(Vec<Signal>),
    /// Bit periods of idle J.
    Idle(u32),
    /// Capture the device's answer, waiting at most that many bit periods for it to start.
    Listen(Option<u32>),
    RegWrite(Reg, u32),
    RegRead(Reg),
    RamWrite(u16, Vec<u8>),
    RamRead(u16, u16),
    RomRead(u32),
    /// Hands the buffer over to the engine.
    OwnerSet(EndpointId),
    OwnerGet(EndpointId),
    Toggle(ToggleOp, EndpointId),
    /// Byte count of the next IN packet of an endpoint.
    InSize(u8, u8),
    OutSize(u8),
    CopyIn(u8, Vec<u8>),
    CopyOut(u8, u8),
}

/// Read-modify-write applied to one DATA_TOGGLE bit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToggleOp {
    Set,
    Clear,
    Toggle,
}

#[derive(Debug, Error, PartialEq)]
#[error("line {line}: {message}")]
pub struct ScriptError {
    pub line: usize,
    pub message: String,
}

type Res<'a, T> = IResult<&'a str, T>;

fn number(i: &str) -> Res<u32> {
    alt((
        map_res(preceded(tag_no_case("0x"), hex_digit1), |s: &str| {
            u32::from_str_radix(s, 16)
        }),
        map_res(digit1, |s: &str| s.parse::<u32>()),
    ))(i)
}

fn address(i: &str) -> Res<u32> {
    verify(number, |n: &u32| *n < 128)(i)
}

fn endpoint(i: &str) -> Res<u32> {
    verify(number, |n: &u32| *n < 16)(i)
}

/// Byte offset in the endpoint RAM.
fn offset(i: &str) -> Res<u32> {
    verify(number, |n: &u32| *n < 1024)(i)
}

fn byte(i: &str) -> Res<u8> {
    map_res(
        take_while_m_n(1, 2, |c: char| c.is_ascii_hexdigit()),
        |s: &str| u8::from_str_radix(s, 16),
    )(i)
}

fn bytes(i: &str) -> Res<Vec<u8>> {
    separated_list(space1, byte)(i)
}

fn word(i: &str) -> Res<&str> {
    take_while1(|c: char| !c.is_whitespace())(i)
}

fn token(i: &str) -> Res<Packet> {
    map(
        tuple((
            alt((
                value(TokenType::Setup, tag("setup")),
                value(TokenType::Out, tag("out")),
                value(TokenType::In, tag("in")),
            )),
            preceded(space1, address),
            preceded(space1, endpoint),
        )),
        |(token_type, address, endpoint)| {
            Packet::Token(Token {
                token_type,
                address: address as u8,
                endpoint: endpoint as u8,
            })
        },
    )(i)
}

fn sof(i: &str) -> Res<Packet> {
    map(
        preceded(
            pair(tag("sof"), space1),
            verify(number, |n: &u32| *n < 2048),
        ),
        |frm_num| Packet::SoF(frm_num as u16),
    )(i)
}

fn data(i: &str) -> Res<Packet> {
    map(
        pair(
            alt((
                value(DataPID::Data0, tag("data0")),
                value(DataPID::Data1, tag("data1")),
            )),
            opt(preceded(space1, bytes)),
        ),
        |(pid, payload)| {
            Packet::Data(Data {
                pid,
                payload: payload.unwrap_or_default(),
            })
        },
    )(i)
}

fn handshake(i: &str) -> Res<Packet> {
    map(
        alt((
            value(HandShake::Ack, tag("ack")),
            value(HandShake::NAck, tag("nak")),
            value(HandShake::Stall, tag("stall")),
        )),
        Packet::HandShake,
    )(i)
}

fn reg(i: &str) -> Res<Reg> {
    map_res(word, |s: &str| s.parse::<Reg>())(i)
}

fn symbol(i: &str) -> Res<Signal> {
    map_res(word, |s: &str| s.parse::<Signal>())(i)
}

fn bus_command(i: &str) -> Res<Command> {
    alt((
        map(
            preceded(
                tuple((tag("reg"), space1, tag("write"), space1)),
                pair(reg, preceded(space1, number)),
            ),
            |(reg, value)| Command::RegWrite(reg, value),
        ),
        map(
            preceded(tuple((tag("reg"), space1, tag("read"), space1)), reg),
            Command::RegRead,
        ),
        map(
            preceded(
                tuple((tag("ram"), space1, tag("write"), space1)),
                pair(offset, preceded(space1, bytes)),
            ),
            |(offset, bytes)| Command::RamWrite(offset as u16, bytes),
        ),
        map(
            preceded(
                tuple((tag("ram"), space1, tag("read"), space1)),
                pair(offset, preceded(space1, verify(number, |n: &u32| *n <= 1024))),
            ),
            |(offset, len)| Command::RamRead(offset as u16, len as u16),
        ),
        map(
            preceded(tuple((tag("rom"), space1, tag("read"), space1)), number),
            Command::RomRead,
        ),
    ))(i)
}

fn endpoint_id(i: &str) -> Res<EndpointId> {
    map(
        pair(
            alt((
                value(Direction::In, tag("in")),
                value(Direction::Out, tag("out")),
            )),
            preceded(space1, endpoint),
        ),
        |(direction, number)| EndpointId::new(direction, number as u8),
    )(i)
}

fn buffer_len(i: &str) -> Res<u8> {
    map(verify(number, |n: &u32| *n <= 8), |n| n as u8)(i)
}

fn firmware_command(i: &str) -> Res<Command> {
    alt((
        map(
            preceded(tuple((tag("owner"), space1, tag("set"), space1)), endpoint_id),
            Command::OwnerSet,
        ),
        map(
            preceded(tuple((tag("owner"), space1, tag("get"), space1)), endpoint_id),
            Command::OwnerGet,
        ),
        map(
            preceded(
                pair(tag("toggle"), space1),
                pair(
                    alt((
                        value(ToggleOp::Set, tag("set")),
                        value(ToggleOp::Clear, tag("clear")),
                        value(ToggleOp::Toggle, tag("toggle")),
                    )),
                    preceded(space1, endpoint_id),
                ),
            ),
            |(op, ep)| Command::Toggle(op, ep),
        ),
        map(
            preceded(
                tuple((tag("size"), space1, tag("in"), space1)),
                pair(endpoint, preceded(space1, buffer_len)),
            ),
            |(ep, size)| Command::InSize(ep as u8, size),
        ),
        map(
            preceded(tuple((tag("size"), space1, tag("out"), space1)), endpoint),
            |ep| Command::OutSize(ep as u8),
        ),
        map(
            preceded(
                tuple((tag("copy"), space1, tag("in"), space1)),
                pair(
                    endpoint,
                    opt(preceded(
                        space1,
                        verify(bytes, |b: &Vec<u8>| b.len() <= 8),
                    )),
                ),
            ),
            |(ep, bytes)| Command::CopyIn(ep as u8, bytes.unwrap_or_default()),
        ),
        map(
            preceded(
                tuple((tag("copy"), space1, tag("out"), space1)),
                pair(endpoint, preceded(space1, buffer_len)),
            ),
            |(ep, len)| Command::CopyOut(ep as u8, len),
        ),
    ))(i)
}

fn command(i: &str) -> Res<Command> {
    alt((
        map(alt((token, sof, data, handshake)), Command::Packet),
        map(
            preceded(pair(tag("lines"), space1), separated_list(space1, symbol)),
            Command::Line,
        ),
        map(preceded(pair(tag("idle"), space1), number), Command::Idle),
        map(
            preceded(tag("listen"), opt(preceded(space1, number))),
            Command::Listen,
        ),
        bus_command,
        firmware_command,
    ))(i)
}

/// `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str) -> Result<Option<Command>, String> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
    .trim();
    if line.is_empty() {
        return Ok(None);
    }
    all_consuming(command)(line)
        .map(|(_, cmd)| Some(cmd))
        .map_err(|_| format!("cannot parse {:?}", line))
}

pub fn parse(text: &str) -> Vec<Result<Command, ScriptError>> {
    text.lines()
        .enumerate()
        .filter_map(|(n, line)| {
            parse_line(line)
                .map_err(|message| ScriptError {
                    line: n + 1,
                    message,
                })
                .transpose()
        })
        .collect()
}

pub struct ScriptSource {
    commands: std::vec::IntoIter<Result<Command, ScriptError>>,
}

impl ScriptSource {
    pub fn new(text: &str) -> Self {
        Self {
            commands: parse(text).into_iter(),
        }
    }
}

impl Iterator for ScriptSource {
    type Item = Event;
    fn next(&mut self) -> Option<Self::Item> {
        let cmd = self.commands.next()?;
        Some((
            0.,
            cmd.map(|cmd| Box::new(cmd) as Box<dyn EventData>)
                .map_err(anyhow::Error::from),
        ))
    }
}

impl EventIterator for ScriptSource {
    fn into_iterator(self: Box<Self>) -> Box<dyn Iterator<Item = Event>> {
        self
    }
    fn event_type(&self) -> std::any::TypeId {
        std::any::TypeId::of::<Command>()
    }
    fn event_type_name(&self) -> &'static str {
        std::any::type_name::<Command>()
    }
}

pub fn build(pipeline: &mut Pipeline, args: &[String]) {
    use clap::Arg;
    let args = clap::SubCommand::with_name("script")
        .setting(clap::AppSettings::NoBinaryName)
        .args(&[
            Arg::from_usage("-v, --verbose 'set to print events to stdout.'"),
            Arg::with_name("file")
                .help("Scenario script, '-' for stdin.")
                .required(true),
        ])
        .get_matches_from(args);

    let file = args.value_of("file").unwrap_or("-");
    let mut text = String::new();
    let read = if file == "-" {
        std::io::stdin().read_to_string(&mut text)
    } else {
        std::fs::File::open(file).and_then(|mut f| f.read_to_string(&mut text))
    };
    if let Err(e) = read.with_context(|| format!("Reading script {}", file)) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }

    let node = Box::new(ScriptSource::new(&text));
    pipeline.push(crate::sink::verbose(node, args.is_present("verbose")));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(line: &str) -> Command {
        parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn host_packets() {
        assert_eq!(
            one("setup 5 0"),
            Command::Packet(Packet::Token(Token {
                token_type: TokenType::Setup,
                address: 5,
                endpoint: 0,
            }))
        );
        assert_eq!(
            one("in 0x3a 10"),
            Command::Packet(Packet::Token(Token {
                token_type: TokenType::In,
                address: 0x3A,
                endpoint: 10,
            }))
        );
        assert_eq!(
            one("data0 23 64 54"),
            Command::Packet(Packet::Data(Data {
                pid: DataPID::Data0,
                payload: vec![0x23, 0x64, 0x54],
            }))
        );
        assert_eq!(
            one("data1"),
            Command::Packet(Packet::Data(Data {
                pid: DataPID::Data1,
                payload: vec![],
            }))
        );
        assert_eq!(one("nak"), Command::Packet(Packet::HandShake(HandShake::NAck)));
        assert_eq!(one("sof 2047"), Command::Packet(Packet::SoF(2047)));
    }

    #[test]
    fn line_and_timing() {
        assert_eq!(
            one("lines K J 0 0 J"),
            Command::Line(vec![
                Signal::K,
                Signal::J,
                Signal::SE0,
                Signal::SE0,
                Signal::J
            ])
        );
        assert_eq!(one("idle 16"), Command::Idle(16));
        assert_eq!(one("listen"), Command::Listen(None));
        assert_eq!(one("listen 40"), Command::Listen(Some(40)));
    }

    #[test]
    fn bus_operations() {
        assert_eq!(
            one("reg write ENDP_OWNER 0x00040002"),
            Command::RegWrite(Reg::EndpOwner, 0x0004_0002)
        );
        assert_eq!(one("reg read 6"), Command::RegRead(Reg::OutSize0_7));
        assert_eq!(
            one("ram write 0x90 de ad"),
            Command::RamWrite(0x90, vec![0xDE, 0xAD])
        );
        assert_eq!(one("ram read 8 3"), Command::RamRead(8, 3));
        assert_eq!(one("rom read 0x40"), Command::RomRead(0x40));
    }

    #[test]
    fn firmware_helpers() {
        let in2 = EndpointId::new(Direction::In, 2);
        assert_eq!(one("owner set in 2"), Command::OwnerSet(in2));
        assert_eq!(
            one("owner get out 15"),
            Command::OwnerGet(EndpointId::new(Direction::Out, 15))
        );
        assert_eq!(
            one("toggle toggle in 2"),
            Command::Toggle(ToggleOp::Toggle, in2)
        );
        assert_eq!(one("toggle clear in 2"), Command::Toggle(ToggleOp::Clear, in2));
        assert_eq!(one("size in 2 5"), Command::InSize(2, 5));
        assert_eq!(one("size out 1"), Command::OutSize(1));
        assert_eq!(one("copy in 2 de ad"), Command::CopyIn(2, vec![0xDE, 0xAD]));
        assert_eq!(one("copy in 2"), Command::CopyIn(2, vec![]));
        assert_eq!(one("copy out 1 3"), Command::CopyOut(1, 3));

        assert!(parse_line("size in 2 9").is_err());
        assert!(parse_line("copy in 2 0 1 2 3 4 5 6 7 8").is_err());
        assert!(parse_line("owner set in 16").is_err());
    }

    #[test]
    fn comments_and_errors() {
        let script = "# header\n\nsetup 5 0 # trailing\nsetup 128 0\ndata0 123\nreg write NOPE 1\n";
        let commands = parse(script);
        assert_eq!(commands.len(), 4);
        assert!(commands[0].is_ok());
        assert_eq!(commands[1].as_ref().unwrap_err().line, 4);
        assert_eq!(commands[2].as_ref().unwrap_err().line, 5);
        assert_eq!(commands[3].as_ref().unwrap_err().line, 6);
        assert_eq!(
            commands[1].as_ref().unwrap_err().to_string(),
            "line 4: cannot parse \"setup 128 0\""
        );
    }
}
