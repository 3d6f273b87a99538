//! Command header and class routing

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{ProtoError, ProtoResult};
use crate::units_to_bytes;

/// Width of the class range reserved for one subsystem
pub const CLASS_RANGE: u8 = 16;

/// Cluster control-plane commands
pub const CLASS_CLUSTER: u8 = 0x00;
/// Volume control-plane commands
pub const CLASS_VOLUME: u8 = 0x10;
/// Group control-plane commands
pub const CLASS_GROUP: u8 = 0x20;
/// Data-plane chunk I/O
pub const CLASS_CHUNK: u8 = 0xF0;

/// Inline payload follows the fixed command
pub const FLAG_INLINE_DATA: u8 = 0x01;

/// Subsystem owning a class range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// Cluster management
    Cluster,
    /// Volume management
    Volume,
    /// Group management
    Group,
    /// Chunk I/O
    Chunk,
    /// Range not assigned to a known subsystem (holds the range base)
    Reserved(u8),
}

impl Subsystem {
    /// Subsystem whose 16-value range contains `class`
    pub fn of(class: u8) -> Self {
        match class - class % CLASS_RANGE {
            CLASS_CLUSTER => Self::Cluster,
            CLASS_VOLUME => Self::Volume,
            CLASS_GROUP => Self::Group,
            CLASS_CHUNK => Self::Chunk,
            base => Self::Reserved(base),
        }
    }

    /// First class value of the range
    pub fn base(&self) -> u8 {
        match self {
            Self::Cluster => CLASS_CLUSTER,
            Self::Volume => CLASS_VOLUME,
            Self::Group => CLASS_GROUP,
            Self::Chunk => CLASS_CHUNK,
            Self::Reserved(base) => *base,
        }
    }
}

/// Handler lookup key: `(class << 8) | sequence`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey(pub u16);

impl ServiceKey {
    /// Build a key from class and sequence
    pub const fn new(class: u8, sequence: u8) -> Self {
        Self(((class as u16) << 8) | sequence as u16)
    }

    /// Class half of the key
    pub const fn class(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Sequence half of the key
    pub const fn sequence(&self) -> u8 {
        self.0 as u8
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}/{:#04x}", self.class(), self.sequence())
    }
}

/// 8-byte header shared by commands and responses
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Whole message length in cache-line units
    pub length: u16,
    /// Command class (subsystem)
    pub class: u8,
    /// Operation within the class
    pub sequence: u8,
    /// Flag bits
    pub flags: u8,
    /// Submission queue group the response is routed to
    pub queue_group: u8,
    /// Submission queue number within the group
    pub queue_number: u16,
}

impl CommandHeader {
    /// Encoded header size
    pub const SIZE: usize = 8;

    /// Header for a single cache-line message with no routing set
    pub fn new(class: u8, sequence: u8) -> Self {
        Self {
            length: 1,
            class,
            sequence,
            flags: 0,
            queue_group: 0,
            queue_number: 0,
        }
    }

    /// Parse from bytes
    pub fn from_bytes(mut buf: &[u8]) -> ProtoResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(ProtoError::ShortBuffer {
                needed: Self::SIZE,
                available: buf.len(),
            });
        }

        Ok(Self {
            length: buf.get_u16_le(),
            class: buf.get_u8(),
            sequence: buf.get_u8(),
            flags: buf.get_u8(),
            queue_group: buf.get_u8(),
            queue_number: buf.get_u16_le(),
        })
    }

    /// Append the encoded header to `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.length);
        buf.put_u8(self.class);
        buf.put_u8(self.sequence);
        buf.put_u8(self.flags);
        buf.put_u8(self.queue_group);
        buf.put_u16_le(self.queue_number);
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Message length in bytes
    pub fn byte_length(&self) -> usize {
        units_to_bytes(self.length)
    }

    /// Handler lookup key
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(self.class, self.sequence)
    }

    /// Subsystem the class belongs to
    pub fn subsystem(&self) -> Subsystem {
        Subsystem::of(self.class)
    }

    /// Whether inline data follows the fixed command
    pub fn has_inline_data(&self) -> bool {
        self.flags & FLAG_INLINE_DATA != 0
    }

    /// Whether `other` carries the same class, sequence and queue routing
    pub fn same_route(&self, other: &CommandHeader) -> bool {
        self.class == other.class
            && self.sequence == other.sequence
            && self.queue_group == other.queue_group
            && self.queue_number == other.queue_number
    }
}

impl fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHeader")
            .field("length", &self.length)
            .field("class", &format_args!("{:#04x}", self.class))
            .field("sequence", &self.sequence)
            .field("flags", &format_args!("{:#04x}", self.flags))
            .field("queue_group", &self.queue_group)
            .field("queue_number", &self.queue_number)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = CommandHeader {
            length: 0x0102,
            class: CLASS_CHUNK,
            sequence: 1,
            flags: FLAG_INLINE_DATA,
            queue_group: 7,
            queue_number: 0x0304,
        };
        let bytes = header.to_bytes();
        assert_eq!(
            bytes.as_ref(),
            &[0x02, 0x01, 0xF0, 0x01, 0x01, 0x07, 0x04, 0x03]
        );
        assert_eq!(CommandHeader::from_bytes(&bytes).unwrap(), header);
        assert!(header.has_inline_data());
        assert_eq!(header.byte_length(), 0x0102 * 64);
    }

    #[test]
    fn test_short_header() {
        let err = CommandHeader::from_bytes(&[0u8; 5]).unwrap_err();
        assert_eq!(
            err,
            ProtoError::ShortBuffer {
                needed: 8,
                available: 5
            }
        );
    }

    #[test]
    fn test_class_ranges_are_disjoint() {
        assert_eq!(Subsystem::of(0x00), Subsystem::Cluster);
        assert_eq!(Subsystem::of(0x0F), Subsystem::Cluster);
        assert_eq!(Subsystem::of(0x10), Subsystem::Volume);
        assert_eq!(Subsystem::of(0x2A), Subsystem::Group);
        assert_eq!(Subsystem::of(0xF3), Subsystem::Chunk);
        assert_eq!(Subsystem::of(0x45), Subsystem::Reserved(0x40));
        assert_eq!(Subsystem::of(0xFF).base(), CLASS_CHUNK);
    }

    #[test]
    fn test_service_key() {
        let key = ServiceKey::new(CLASS_CHUNK, 3);
        assert_eq!(key.0, 0xF003);
        assert_eq!(key.class(), CLASS_CHUNK);
        assert_eq!(key.sequence(), 3);
        assert_eq!(key.to_string(), "0xf0/0x03");
    }
}
