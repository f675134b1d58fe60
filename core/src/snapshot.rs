//! Tag/length/value snapshot streams.
//!
//! A stream begins with its 32-bit little-endian total size (including the
//! size field itself) and is followed by records. Each record is a one-byte
//! tag, a length-prefixed key (32-bit LE length, then the bytes) and a
//! tag-dependent body:
//!
//! | tag | body                                  |
//! |-----|---------------------------------------|
//! | 1   | 32-bit LE integer                     |
//! | 2   | length-prefixed string                |
//! | 3   | nested stream                         |
//! | 4   | length-prefixed raw bytes             |
//! | 5   | one byte, zero or non-zero            |
//!
//! Values are represented in memory as a tree of [`Node`]s; serialization
//! and deserialization are total on that tree. Parsing is strict about
//! sizes: a nested stream claiming more bytes than its parent has left is a
//! hard error and leaves the caller's state untouched.

use std::error::Error;
use std::fmt;

const TAG_INT: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_STRUCT: u8 = 3;
const TAG_BLOB: u8 = 4;
const TAG_BOOL: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Int(i32),
    Str(String),
    Struct(Vec<(String, Node)>),
    Blob(Vec<u8>),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The stream ended before a declared length.
    Truncated,
    /// A stream's declared size exceeds the bytes available to it.
    SizeExceeded { declared: usize, available: usize },
    UnknownTag(u8),
    /// A key or string body is not valid UTF-8.
    BadString,
    /// The tree parsed but does not have the layout the caller expects.
    WrongShape(&'static str),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "snapshot stream truncated"),
            Self::SizeExceeded {
                declared,
                available,
            } => write!(
                f,
                "snapshot stream declares {declared} bytes but only {available} are available"
            ),
            Self::UnknownTag(tag) => write!(f, "unknown snapshot tag {tag}"),
            Self::BadString => write!(f, "snapshot key or string is not UTF-8"),
            Self::WrongShape(what) => write!(f, "snapshot has the wrong shape: {what}"),
        }
    }
}

impl Error for SnapshotError {}

/// Serializes a record list into a self-describing stream.
#[must_use]
pub fn serialize(fields: &[(String, Node)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (key, node) in fields {
        write_record(&mut body, key, node);
    }

    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

fn write_record(out: &mut Vec<u8>, key: &str, node: &Node) {
    out.push(match node {
        Node::Int(_) => TAG_INT,
        Node::Str(_) => TAG_STRING,
        Node::Struct(_) => TAG_STRUCT,
        Node::Blob(_) => TAG_BLOB,
        Node::Bool(_) => TAG_BOOL,
    });
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(key.as_bytes());

    match node {
        Node::Int(value) => out.extend_from_slice(&value.to_le_bytes()),
        Node::Str(value) => {
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        Node::Struct(fields) => out.extend_from_slice(&serialize(fields)),
        Node::Blob(bytes) => {
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        Node::Bool(value) => out.push(u8::from(*value)),
    }
}

/// Parses a stream back into its record list.
pub fn deserialize(bytes: &[u8]) -> Result<Vec<(String, Node)>, SnapshotError> {
    let mut reader = Reader::new(bytes);
    let fields = reader.stream()?;
    Ok(fields)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        if self.pos + len > self.bytes.len() {
            return Err(SnapshotError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, SnapshotError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("four bytes")))
    }

    fn string(&mut self) -> Result<String, SnapshotError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SnapshotError::BadString)
    }

    /// Reads one full stream: total size, then records until the size is
    /// consumed.
    fn stream(&mut self) -> Result<Vec<(String, Node)>, SnapshotError> {
        let declared = self.u32()? as usize;
        let available = self.bytes.len() - self.pos + 4;
        if declared > available {
            return Err(SnapshotError::SizeExceeded {
                declared,
                available,
            });
        }
        if declared < 4 {
            return Err(SnapshotError::Truncated);
        }
        let end = self.pos + declared - 4;

        let mut fields = Vec::new();
        while self.pos < end {
            let tag = self.u8()?;
            let key = self.string()?;
            let node = match tag {
                TAG_INT => Node::Int(self.u32()? as i32),
                TAG_STRING => Node::Str(self.string()?),
                TAG_STRUCT => {
                    // The nested stream may claim at most the bytes left in
                    // this one.
                    let remaining = end - self.pos;
                    let mut nested = Reader::new(&self.bytes[self.pos..self.pos + remaining]);
                    let fields = nested.stream()?;
                    self.pos += nested.pos;
                    Node::Struct(fields)
                }
                TAG_BLOB => {
                    let len = self.u32()? as usize;
                    Node::Blob(self.take(len)?.to_vec())
                }
                TAG_BOOL => Node::Bool(self.u8()? != 0),
                tag => return Err(SnapshotError::UnknownTag(tag)),
            };
            fields.push((key, node));
        }
        Ok(fields)
    }
}

/// Looks up a field in a parsed record list.
pub fn field<'a>(
    fields: &'a [(String, Node)],
    key: &'static str,
) -> Result<&'a Node, SnapshotError> {
    fields
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, node)| node)
        .ok_or(SnapshotError::WrongShape(key))
}
