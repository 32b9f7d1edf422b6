use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::wire::WireBufExt;
use crate::error::PacketError;

pub const OUT_OF_BAND_PREFIX: u32 = 0xFFFF_FFFF;

pub const MSG_ROUTE: u32 = 0xE938_445B;
pub const MSG_FRAME: u32 = 0x53FF_FA3F;
pub const MSG_END: u32 = 0xCA56_9E63;

/// Servers at or above this version echo the frame number back and expect it.
pub const FRAME_ECHO_MIN_PROTOCOL: u32 = 2;
/// Servers at or above this version append an RTT sample to each frame message.
pub const FRAME_RTT_MIN_PROTOCOL: u32 = 3;

pub const MAX_OUT_OF_BAND_TEXT: usize = 32764;

/// Largest payload a UDP datagram can carry over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65507;
/// Largest reliable payload that still fits one client datagram next to the
/// ack, frame echo, command header and end tag.
pub const MAX_RELIABLE_PAYLOAD: usize = MAX_UDP_PAYLOAD - 4 - 4 - 10 - 4;

pub const MSG_IQUIT: &str = "msgIQuit";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandIdFlags: u32 {
        const LONG_LENGTH = 0x8000_0000;
    }
}

/// Jenkins one-at-a-time hash of the lowercased name. Reliable command types
/// are identified on the wire by this value.
pub fn command_hash(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for byte in name.bytes() {
        hash = hash.wrapping_add(byte.to_ascii_lowercase() as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

pub fn is_out_of_band(data: &[u8]) -> bool {
    data.len() >= 4 && u32::from_le_bytes([data[0], data[1], data[2], data[3]]) == OUT_OF_BAND_PREFIX
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutOfBand {
    ConnectOk {
        client_net_id: u16,
        host_net_id: u16,
        host_base: u32,
    },
    Error(String),
    Connect {
        token: String,
        guid: u64,
    },
    Other(String),
}

impl OutOfBand {
    /// Parses the text following the `0xFFFFFFFF` prefix.
    pub fn parse(raw: &[u8]) -> Result<Self, PacketError> {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim_end_matches(['\0', '\n', '\r', ' ']);

        let (command, rest) = match text.split_once(' ') {
            Some((command, rest)) => (command, rest),
            None => (text, ""),
        };

        if command.eq_ignore_ascii_case("connectOK") {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(PacketError::MalformedOutOfBand(format!(
                    "connectOK expects 3 fields, got {}",
                    fields.len()
                )));
            }
            let bad = |field: &str| PacketError::MalformedOutOfBand(format!("bad field {:?}", field));
            return Ok(OutOfBand::ConnectOk {
                client_net_id: fields[0].parse().map_err(|_| bad(fields[0]))?,
                host_net_id: fields[1].parse().map_err(|_| bad(fields[1]))?,
                host_base: fields[2].parse().map_err(|_| bad(fields[2]))?,
            });
        }

        if command.eq_ignore_ascii_case("error") {
            return Ok(OutOfBand::Error(rest.to_string()));
        }

        if command.eq_ignore_ascii_case("connect") {
            let mut token = None;
            let mut guid = None;
            for pair in rest.split('&') {
                match pair.split_once('=') {
                    Some(("token", value)) => token = Some(value.to_string()),
                    Some(("guid", value)) => guid = value.parse().ok(),
                    _ => {}
                }
            }
            return match (token, guid) {
                (Some(token), Some(guid)) => Ok(OutOfBand::Connect { token, guid }),
                _ => Err(PacketError::MalformedOutOfBand(format!(
                    "connect request missing token or guid: {:?}",
                    rest
                ))),
            };
        }

        Ok(OutOfBand::Other(text.to_string()))
    }

    pub fn to_text(&self) -> String {
        match self {
            OutOfBand::ConnectOk {
                client_net_id,
                host_net_id,
                host_base,
            } => format!("connectOK {} {} {}", client_net_id, host_net_id, host_base),
            OutOfBand::Error(message) => format!("error {}", message),
            OutOfBand::Connect { token, guid } => format!("connect token={}&guid={}", token, guid),
            OutOfBand::Other(text) => text.clone(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let text = self.to_text();
        if text.len() >= MAX_OUT_OF_BAND_TEXT {
            return Err(PacketError::MalformedOutOfBand(format!(
                "{} bytes exceeds the out-of-band limit",
                text.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(4 + text.len());
        buf.put_u32_le(OUT_OF_BAND_PREFIX);
        buf.put_slice(text.as_bytes());
        Ok(buf.freeze())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    Routed { peer_id: u16, payload: Vec<u8> },
    Frame { number: u32, rtt: Option<i32> },
    Reliable { tag: u32, id: u32, payload: Vec<u8> },
    End,
}

impl SessionMessage {
    /// Bytes this message occupied on the wire, tag excluded.
    pub fn body_len(&self) -> usize {
        match self {
            SessionMessage::Routed { payload, .. } => 4 + payload.len(),
            SessionMessage::Frame { rtt, .. } => 4 + if rtt.is_some() { 4 } else { 0 },
            SessionMessage::Reliable { payload, .. } => {
                let length_field = if payload.len() > u16::MAX as usize { 4 } else { 2 };
                4 + length_field + payload.len()
            }
            SessionMessage::End => 0,
        }
    }
}

/// Cursor over one in-session datagram.
pub struct SessionReader<'a> {
    buf: &'a [u8],
    protocol: u32,
}

impl<'a> SessionReader<'a> {
    pub fn new(data: &'a [u8], protocol: u32) -> Self {
        Self {
            buf: data,
            protocol,
        }
    }

    /// Reads one untagged header word (the ack counter, or the frame echo the
    /// client sends at protocol 2+).
    pub fn read_header(&mut self) -> Result<u32, PacketError> {
        Ok(self.buf.try_get_u32_le()?)
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    pub fn next_message(&mut self) -> Result<SessionMessage, PacketError> {
        let tag = self.buf.try_get_u32_le()?;

        match tag {
            MSG_END => Ok(SessionMessage::End),
            MSG_ROUTE => {
                let peer_id = self.buf.try_get_u16_le()?;
                let length = self.buf.try_get_u16_le()? as usize;
                let payload = self.buf.try_get_bytes(length)?;
                Ok(SessionMessage::Routed { peer_id, payload })
            }
            MSG_FRAME => {
                let number = self.buf.try_get_u32_le()?;
                let rtt = if self.protocol >= FRAME_RTT_MIN_PROTOCOL {
                    Some(self.buf.try_get_i32_le()?)
                } else {
                    None
                };
                Ok(SessionMessage::Frame { number, rtt })
            }
            tag => {
                let raw_id = self.buf.try_get_u32_le()?;
                let flags = CommandIdFlags::from_bits_truncate(raw_id);
                let id = raw_id & !CommandIdFlags::LONG_LENGTH.bits();
                let length = if flags.contains(CommandIdFlags::LONG_LENGTH) {
                    self.buf.try_get_u32_le()? as usize
                } else {
                    self.buf.try_get_u16_le()? as usize
                };
                let payload = self.buf.try_get_bytes(length)?;
                Ok(SessionMessage::Reliable { tag, id, payload })
            }
        }
    }
}

/// Builder for one in-session datagram. [`DatagramWriter::finish`] appends the
/// end tag.
#[derive(Debug)]
pub struct DatagramWriter {
    buf: BytesMut,
}

impl DatagramWriter {
    pub fn new(ack: u32) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u32_le(ack);
        Self { buf }
    }

    pub fn put_header(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_routed(&mut self, peer_id: u16, payload: &[u8]) {
        debug_assert!(payload.len() <= u16::MAX as usize);
        self.buf.put_u32_le(MSG_ROUTE);
        self.buf.put_u16_le(peer_id);
        self.buf.put_u16_le(payload.len() as u16);
        self.buf.put_slice(payload);
    }

    pub fn write_frame(&mut self, number: u32, rtt: Option<i32>) {
        self.buf.put_u32_le(MSG_FRAME);
        self.buf.put_u32_le(number);
        if let Some(rtt) = rtt {
            self.buf.put_i32_le(rtt);
        }
    }

    pub fn write_reliable(&mut self, tag: u32, id: u32, payload: &[u8]) {
        self.buf.put_u32_le(tag);
        if payload.len() > u16::MAX as usize {
            self.buf.put_u32_le(id | CommandIdFlags::LONG_LENGTH.bits());
            self.buf.put_u32_le(payload.len() as u32);
        } else {
            self.buf.put_u32_le(id);
            self.buf.put_u16_le(payload.len() as u16);
        }
        self.buf.put_slice(payload);
    }

    /// Appends an arbitrary tagged message, for callers extending the
    /// outbound message.
    pub fn write_message(&mut self, tag: u32, body: &[u8]) {
        self.buf.put_u32_le(tag);
        self.buf.put_slice(body);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(mut self) -> Bytes {
        self.buf.put_u32_le(MSG_END);
        self.buf.freeze()
    }
}
