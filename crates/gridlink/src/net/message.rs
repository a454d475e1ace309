use std::fmt;
use std::net::Ipv4Addr;

use glam::{Quat, Vec3};
use uuid::Uuid;

use super::template::{FieldType, MessageTemplate, MessageType};

/// A typed field value as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Uuid(Uuid),
    Vector3(Vec3),
    Quaternion(Quat),
    IpAddr(Ipv4Addr),
    IpPort(u16),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Encodes `text` the way variable string fields travel: UTF-8 with a
    /// trailing NUL. The empty string stays empty.
    pub fn text(text: &str) -> Self {
        if text.is_empty() {
            return Self::Bytes(Vec::new());
        }
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        Self::Bytes(bytes)
    }

    pub fn matches(&self, ty: FieldType) -> bool {
        matches!(
            (self, ty),
            (Self::U8(_), FieldType::U8)
                | (Self::U16(_), FieldType::U16)
                | (Self::U32(_), FieldType::U32)
                | (Self::U64(_), FieldType::U64)
                | (Self::I8(_), FieldType::I8)
                | (Self::I16(_), FieldType::I16)
                | (Self::I32(_), FieldType::I32)
                | (Self::I64(_), FieldType::I64)
                | (Self::F32(_), FieldType::F32)
                | (Self::F64(_), FieldType::F64)
                | (Self::Bool(_), FieldType::Bool)
                | (Self::Uuid(_), FieldType::Uuid)
                | (Self::Vector3(_), FieldType::Vector3)
                | (Self::Quaternion(_), FieldType::Quaternion)
                | (Self::IpAddr(_), FieldType::IpAddr)
                | (Self::IpPort(_), FieldType::IpPort)
                | (Self::Bytes(_), FieldType::Variable1 | FieldType::Variable2)
        )
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::U8(_) => "U8",
            Self::U16(_) => "U16",
            Self::U32(_) => "U32",
            Self::U64(_) => "U64",
            Self::I8(_) => "S8",
            Self::I16(_) => "S16",
            Self::I32(_) => "S32",
            Self::I64(_) => "S64",
            Self::F32(_) => "F32",
            Self::F64(_) => "F64",
            Self::Bool(_) => "BOOL",
            Self::Uuid(_) => "LLUUID",
            Self::Vector3(_) => "LLVector3",
            Self::Quaternion(_) => "LLQuaternion",
            Self::IpAddr(_) => "IPADDR",
            Self::IpPort(_) => "IPPORT",
            Self::Bytes(_) => "Variable",
        }
    }
}

/// Failure to read a typed field out of a decoded message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("message has no block named {0}")]
    MissingBlock(&'static str),
    #[error("block {block} has no field named {field}")]
    MissingField { block: &'static str, field: String },
    #[error("field {field} is {actual}, expected {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// One named block: an ordered list of named field values.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: &'static str,
    pub fields: Vec<(&'static str, FieldValue)>,
}

macro_rules! typed_getter {
    ($fn_name:ident, $variant:ident, $ty:ty, $label:literal) => {
        pub fn $fn_name(&self, field: &str) -> Result<$ty, FieldError> {
            match self.get(field)? {
                FieldValue::$variant(value) => Ok(*value),
                other => Err(FieldError::WrongType {
                    field: field.to_string(),
                    expected: $label,
                    actual: other.kind_name(),
                }),
            }
        }
    };
}

impl Block {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
        }
    }

    pub fn with(mut self, field: &'static str, value: FieldValue) -> Self {
        self.fields.push((field, value));
        self
    }

    pub fn get(&self, field: &str) -> Result<&FieldValue, FieldError> {
        self.fields
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, value)| value)
            .ok_or_else(|| FieldError::MissingField {
                block: self.name,
                field: field.to_string(),
            })
    }

    typed_getter!(u8, U8, u8, "U8");
    typed_getter!(u16, U16, u16, "U16");
    typed_getter!(u32, U32, u32, "U32");
    typed_getter!(u64, U64, u64, "U64");
    typed_getter!(i32, I32, i32, "S32");
    typed_getter!(f32, F32, f32, "F32");
    typed_getter!(bool, Bool, bool, "BOOL");
    typed_getter!(uuid, Uuid, Uuid, "LLUUID");
    typed_getter!(vector3, Vector3, Vec3, "LLVector3");
    typed_getter!(quaternion, Quaternion, Quat, "LLQuaternion");
    typed_getter!(ip_addr, IpAddr, Ipv4Addr, "IPADDR");
    typed_getter!(ip_port, IpPort, u16, "IPPORT");

    pub fn bytes(&self, field: &str) -> Result<&[u8], FieldError> {
        match self.get(field)? {
            FieldValue::Bytes(bytes) => Ok(bytes),
            other => Err(FieldError::WrongType {
                field: field.to_string(),
                expected: "Variable",
                actual: other.kind_name(),
            }),
        }
    }

    /// Reads a variable field as text, dropping the trailing NUL.
    pub fn string(&self, field: &str) -> Result<String, FieldError> {
        let bytes = self.bytes(field)?;
        let trimmed = match bytes.iter().position(|&b| b == 0) {
            Some(end) => &bytes[..end],
            None => bytes,
        };
        Ok(String::from_utf8_lossy(trimmed).into_owned())
    }
}

/// A decoded or outbound message.
///
/// `reliable` asks the peer for an acknowledgement. `resent` is owned by the
/// transport and only set on retransmissions.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageType,
    pub reliable: bool,
    pub resent: bool,
    pub blocks: Vec<Block>,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            reliable: false,
            resent: false,
            blocks: Vec::new(),
        }
    }

    pub fn with_block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn template(&self) -> &'static MessageTemplate {
        self.kind.template()
    }

    /// First block with the given name.
    pub fn block(&self, name: &'static str) -> Result<&Block, FieldError> {
        self.blocks
            .iter()
            .find(|block| block.name == name)
            .ok_or(FieldError::MissingBlock(name))
    }

    /// Every block with the given name, in wire order.
    pub fn blocks_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Block> + 'a {
        self.blocks.iter().filter(move |block| block.name == name)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.template().name)?;
        if self.reliable {
            write!(f, " [reliable]")?;
        }
        if self.resent {
            write!(f, " [resent]")?;
        }
        Ok(())
    }
}
