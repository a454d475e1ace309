use std::net::Ipv4Addr;

use bitflags::bitflags;
use glam::{Quat, Vec3};
use uuid::Uuid;

use super::message::{Block, FieldValue, Message};
use super::template::{BlockCount, FieldType, Frequency, MessageType, wire_id};
use super::zerocode;

/// Largest frame the transport will put on the wire.
pub const MAX_PACKET_SIZE: usize = 1200;
/// Receive buffer size; larger than `MAX_PACKET_SIZE` so oversized peers are
/// decoded rather than truncated by the socket.
pub const RECV_BUFFER_SIZE: usize = 4096;
/// Upper bound on a zero-decoded body.
pub const MAX_BODY_SIZE: usize = 8192;
pub const MAX_APPENDED_ACKS: usize = u8::MAX as usize;

const HEADER_SIZE: usize = 5;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        const RELIABLE = 0b0000_0001;
        const RESENT = 0b0000_0010;
        const ZEROCODED = 0b0000_0100;
        const APPENDED_ACKS = 0b0000_1000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("unknown message type {0:#010x}")]
    UnknownType(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{message}: expected {expected} {block} block(s), found {found}")]
    BlockCount {
        message: &'static str,
        block: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{message}: block {block} is not part of this message")]
    UnknownBlock {
        message: &'static str,
        block: &'static str,
    },
    #[error("{message}.{block}: missing field {field}")]
    MissingField {
        message: &'static str,
        block: &'static str,
        field: &'static str,
    },
    #[error("{message}.{block}: field {field} does not match its declared type")]
    FieldType {
        message: &'static str,
        block: &'static str,
        field: &'static str,
    },
    #[error("{message}.{block}: field {field} is {len} bytes, limit {limit}")]
    FieldTooLong {
        message: &'static str,
        block: &'static str,
        field: &'static str,
        len: usize,
        limit: usize,
    },
    #[error("{0} acks do not fit in one frame")]
    TooManyAcks(usize),
}

/// Body layout `serialize` produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyEncoding {
    /// Zero-coded only when that makes the body smaller.
    #[default]
    Auto,
    Plain,
    ZeroCoded,
}

/// One frame: header, message and any piggybacked acks.
///
/// Decoded packets remember whether their body arrived zero-coded, so
/// serializing one reproduces the received bytes exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub message: Message,
    pub acks: Vec<u32>,
    pub encoding: BodyEncoding,
}

impl Packet {
    pub fn new(sequence: u32, message: Message) -> Self {
        let mut flags = PacketFlags::empty();
        flags.set(PacketFlags::RELIABLE, message.reliable);
        flags.set(PacketFlags::RESENT, message.resent);
        Self {
            header: PacketHeader { flags, sequence },
            message,
            acks: Vec::new(),
            encoding: BodyEncoding::Auto,
        }
    }

    pub fn with_acks(mut self, acks: Vec<u32>) -> Self {
        self.acks = acks;
        self
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn is_reliable(&self) -> bool {
        self.header.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_resent(&self) -> bool {
        self.header.flags.contains(PacketFlags::RESENT)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        if self.acks.len() > MAX_APPENDED_ACKS {
            return Err(EncodeError::TooManyAcks(self.acks.len()));
        }

        let body = encode_body(&self.message)?;

        let mut flags = self.header.flags - PacketFlags::ZEROCODED - PacketFlags::APPENDED_ACKS;
        flags.set(PacketFlags::RELIABLE, self.message.reliable);
        flags.set(PacketFlags::RESENT, self.message.resent);
        let body = match self.encoding {
            BodyEncoding::Plain => body,
            BodyEncoding::ZeroCoded => {
                flags |= PacketFlags::ZEROCODED;
                zerocode::encode(&body)
            }
            BodyEncoding::Auto => {
                let compressed = zerocode::encode(&body);
                if compressed.len() < body.len() {
                    flags |= PacketFlags::ZEROCODED;
                    compressed
                } else {
                    body
                }
            }
        };
        if !self.acks.is_empty() {
            flags |= PacketFlags::APPENDED_ACKS;
        }

        let mut data = Vec::with_capacity(HEADER_SIZE + body.len() + self.acks.len() * 4 + 1);
        data.push(flags.bits());
        data.extend_from_slice(&self.header.sequence.to_be_bytes());
        data.extend_from_slice(&body);
        if !self.acks.is_empty() {
            for ack in &self.acks {
                data.extend_from_slice(&ack.to_be_bytes());
            }
            data.push(self.acks.len() as u8);
        }
        Ok(data)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_SIZE {
            return Err(DecodeError::Malformed("truncated header"));
        }
        let flags =
            PacketFlags::from_bits(data[0]).ok_or(DecodeError::Malformed("unknown flag bits"))?;
        let sequence = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);

        let mut rest = &data[HEADER_SIZE..];
        let mut acks = Vec::new();
        if flags.contains(PacketFlags::APPENDED_ACKS) {
            let (&count, before) = rest
                .split_last()
                .ok_or(DecodeError::Malformed("missing ack count"))?;
            let count = count as usize;
            if count == 0 {
                return Err(DecodeError::Malformed("empty ack block"));
            }
            let ack_bytes = count * 4;
            if before.len() < ack_bytes {
                return Err(DecodeError::Malformed("truncated ack block"));
            }
            let (body, tail) = before.split_at(before.len() - ack_bytes);
            acks = tail
                .chunks_exact(4)
                .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            rest = body;
        }

        let expanded;
        let (body, encoding) = if flags.contains(PacketFlags::ZEROCODED) {
            expanded = zerocode::decode(rest, MAX_BODY_SIZE)?;
            // Only maximal runs, so re-encoding yields the same bytes.
            if zerocode::encode(&expanded) != rest {
                return Err(DecodeError::Malformed("non-canonical zero run"));
            }
            (&expanded[..], BodyEncoding::ZeroCoded)
        } else {
            (rest, BodyEncoding::Plain)
        };

        let mut message = decode_body(body)?;
        message.reliable = flags.contains(PacketFlags::RELIABLE);
        message.resent = flags.contains(PacketFlags::RESENT);

        Ok(Self {
            header: PacketHeader { flags, sequence },
            message,
            acks,
            encoding,
        })
    }
}

fn encode_body(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let template = message.template();
    let mut out = Vec::with_capacity(64);

    match template.frequency {
        Frequency::High => out.push(template.number as u8),
        Frequency::Medium => out.extend_from_slice(&[0xFF, template.number as u8]),
        Frequency::Low => {
            out.extend_from_slice(&[0xFF, 0xFF]);
            out.extend_from_slice(&template.number.to_be_bytes());
        }
        Frequency::Fixed => out.extend_from_slice(&[0xFF, 0xFF, 0xFF, template.number as u8]),
    }

    if let Some(stray) = message
        .blocks
        .iter()
        .find(|block| !template.blocks.iter().any(|t| t.name == block.name))
    {
        return Err(EncodeError::UnknownBlock {
            message: template.name,
            block: stray.name,
        });
    }

    for block_template in template.blocks {
        let instances: Vec<&Block> = message.blocks_named(block_template.name).collect();
        let count_error = |expected| EncodeError::BlockCount {
            message: template.name,
            block: block_template.name,
            expected,
            found: instances.len(),
        };
        match block_template.count {
            BlockCount::Single if instances.len() != 1 => return Err(count_error(1)),
            BlockCount::Multiple(n) if instances.len() != n as usize => {
                return Err(count_error(n as usize));
            }
            BlockCount::Variable => {
                if instances.len() > u8::MAX as usize {
                    return Err(count_error(u8::MAX as usize));
                }
                out.push(instances.len() as u8);
            }
            _ => {}
        }

        for block in instances {
            for field in block_template.fields {
                let value = block
                    .fields
                    .iter()
                    .find(|(name, _)| *name == field.name)
                    .map(|(_, value)| value)
                    .ok_or(EncodeError::MissingField {
                        message: template.name,
                        block: block.name,
                        field: field.name,
                    })?;
                if !value.matches(field.ty) {
                    return Err(EncodeError::FieldType {
                        message: template.name,
                        block: block.name,
                        field: field.name,
                    });
                }
                write_field(&mut out, field.ty, value).map_err(|(len, limit)| {
                    EncodeError::FieldTooLong {
                        message: template.name,
                        block: block.name,
                        field: field.name,
                        len,
                        limit,
                    }
                })?;
            }
        }
    }

    Ok(out)
}

fn write_field(out: &mut Vec<u8>, ty: FieldType, value: &FieldValue) -> Result<(), (usize, usize)> {
    match value {
        FieldValue::U8(v) => out.push(*v),
        FieldValue::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Bool(v) => out.push(*v as u8),
        FieldValue::Uuid(v) => out.extend_from_slice(v.as_bytes()),
        FieldValue::Vector3(v) => {
            for component in v.to_array() {
                out.extend_from_slice(&component.to_le_bytes());
            }
        }
        FieldValue::Quaternion(q) => {
            // Packed as x, y, z with w >= 0. Callers pass unit quaternions.
            let q = if q.w < 0.0 { -*q } else { *q };
            for component in [q.x, q.y, q.z] {
                out.extend_from_slice(&component.to_le_bytes());
            }
        }
        FieldValue::IpAddr(v) => out.extend_from_slice(&v.octets()),
        FieldValue::IpPort(v) => out.extend_from_slice(&v.to_be_bytes()),
        FieldValue::Bytes(bytes) => match ty {
            FieldType::Variable1 => {
                if bytes.len() > u8::MAX as usize {
                    return Err((bytes.len(), u8::MAX as usize));
                }
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            }
            _ => {
                if bytes.len() > u16::MAX as usize {
                    return Err((bytes.len(), u16::MAX as usize));
                }
                out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                out.extend_from_slice(bytes);
            }
        },
    }
    Ok(())
}

/// Bounds-checked cursor over an untrusted body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(DecodeError::Malformed("truncated body"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }
}

fn decode_body(body: &[u8]) -> Result<Message, DecodeError> {
    let mut reader = Reader::new(body);

    let (frequency, number) = match reader.u8()? {
        0xFF => match reader.u8()? {
            0xFF => {
                let [hi, lo] = reader.array::<2>()?;
                if hi == 0xFF {
                    (Frequency::Fixed, lo as u16)
                } else {
                    (Frequency::Low, u16::from_be_bytes([hi, lo]))
                }
            }
            medium => (Frequency::Medium, medium as u16),
        },
        high => (Frequency::High, high as u16),
    };
    let kind = MessageType::from_wire(frequency, number)
        .ok_or(DecodeError::UnknownType(wire_id(frequency, number)))?;
    let template = kind.template();

    let mut message = Message::new(kind);
    for block_template in template.blocks {
        let count = match block_template.count {
            BlockCount::Single => 1,
            BlockCount::Multiple(n) => n as usize,
            BlockCount::Variable => reader.u8()? as usize,
        };
        for _ in 0..count {
            let mut block = Block::new(block_template.name);
            for field in block_template.fields {
                block
                    .fields
                    .push((field.name, read_field(&mut reader, field.ty)?));
            }
            message.blocks.push(block);
        }
    }

    if !reader.is_empty() {
        return Err(DecodeError::Malformed("trailing bytes after message"));
    }
    Ok(message)
}

fn read_field(reader: &mut Reader<'_>, ty: FieldType) -> Result<FieldValue, DecodeError> {
    Ok(match ty {
        FieldType::U8 => FieldValue::U8(reader.u8()?),
        FieldType::U16 => FieldValue::U16(u16::from_le_bytes(reader.array()?)),
        FieldType::U32 => FieldValue::U32(u32::from_le_bytes(reader.array()?)),
        FieldType::U64 => FieldValue::U64(u64::from_le_bytes(reader.array()?)),
        FieldType::I8 => FieldValue::I8(i8::from_le_bytes(reader.array()?)),
        FieldType::I16 => FieldValue::I16(i16::from_le_bytes(reader.array()?)),
        FieldType::I32 => FieldValue::I32(i32::from_le_bytes(reader.array()?)),
        FieldType::I64 => FieldValue::I64(i64::from_le_bytes(reader.array()?)),
        FieldType::F32 => FieldValue::F32(reader.f32()?),
        FieldType::F64 => FieldValue::F64(f64::from_le_bytes(reader.array()?)),
        FieldType::Bool => match reader.u8()? {
            0 => FieldValue::Bool(false),
            1 => FieldValue::Bool(true),
            _ => return Err(DecodeError::Malformed("bool out of range")),
        },
        FieldType::Uuid => FieldValue::Uuid(Uuid::from_bytes(reader.array()?)),
        FieldType::Vector3 => {
            FieldValue::Vector3(Vec3::new(reader.f32()?, reader.f32()?, reader.f32()?))
        }
        FieldType::Quaternion => {
            let (x, y, z) = (reader.f32()?, reader.f32()?, reader.f32()?);
            let w = (1.0 - (x * x + y * y + z * z)).max(0.0).sqrt();
            FieldValue::Quaternion(Quat::from_xyzw(x, y, z, w))
        }
        FieldType::IpAddr => FieldValue::IpAddr(Ipv4Addr::from(reader.array::<4>()?)),
        FieldType::IpPort => FieldValue::IpPort(u16::from_be_bytes(reader.array()?)),
        FieldType::Variable1 => {
            let len = reader.u8()? as usize;
            FieldValue::Bytes(reader.take(len)?.to_vec())
        }
        FieldType::Variable2 => {
            let len = u16::from_le_bytes(reader.array()?) as usize;
            FieldValue::Bytes(reader.take(len)?.to_vec())
        }
    })
}
