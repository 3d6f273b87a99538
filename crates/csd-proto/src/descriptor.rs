//! Remote memory descriptor

use bytes::{Buf, BufMut};
use std::fmt;

use crate::error::{ProtoError, ProtoResult};

/// A buffer on the peer: address, length and remote-access key.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryDescriptor {
    /// Remote virtual address
    pub addr: u64,
    /// Buffer length in bytes
    pub length: u32,
    /// Remote-access key
    pub key: u32,
}

impl MemoryDescriptor {
    /// Encoded size
    pub const SIZE: usize = 16;

    /// Create a descriptor
    pub fn new(addr: u64, length: u32, key: u32) -> Self {
        Self { addr, length, key }
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
            addr: buf.get_u64_le(),
            length: buf.get_u32_le(),
            key: buf.get_u32_le(),
        })
    }

    /// Append the encoded descriptor to `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.addr);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.key);
    }

    /// Whether `[addr, addr + len)` lies inside this descriptor
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let (Some(end), Some(limit)) = (addr.checked_add(len as u64), self.end()) else {
            return false;
        };
        addr >= self.addr && end <= limit
    }

    /// Sub-range starting `offset` bytes in, `len` bytes long
    pub fn slice(&self, offset: u32, len: u32) -> Option<Self> {
        let end = offset.checked_add(len)?;
        if end > self.length {
            return None;
        }
        let addr = self.addr.checked_add(offset as u64)?;
        Some(Self::new(addr, len, self.key))
    }

    /// One past the last byte, if it fits in the address space
    fn end(&self) -> Option<u64> {
        self.addr.checked_add(self.length as u64)
    }
}

impl fmt::Debug for MemoryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDescriptor")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("length", &self.length)
            .field("key", &format_args!("{:#x}", self.key))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_descriptor_layout() {
        let desc = MemoryDescriptor::new(0x1122_3344_5566_7788, 4096, 0xABCD);
        let mut buf = BytesMut::new();
        desc.encode(&mut buf);
        assert_eq!(buf.len(), MemoryDescriptor::SIZE);
        assert_eq!(&buf[..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&buf[8..12], &4096u32.to_le_bytes());
        assert_eq!(MemoryDescriptor::from_bytes(&buf).unwrap(), desc);
    }

    #[test]
    fn test_contains_and_slice() {
        let desc = MemoryDescriptor::new(0x1000, 0x100, 1);
        assert!(desc.contains(0x1000, 0x100));
        assert!(desc.contains(0x10F0, 0x10));
        assert!(!desc.contains(0x10F0, 0x11));
        assert!(!desc.contains(0xFFF, 1));
        assert!(!desc.contains(u64::MAX, 2));

        let sub = desc.slice(0x80, 0x40).unwrap();
        assert_eq!(sub.addr, 0x1080);
        assert_eq!(sub.length, 0x40);
        assert!(desc.slice(0xF0, 0x20).is_none());
    }

    #[test]
    fn test_wrapping_descriptor_is_rejected() {
        let desc = MemoryDescriptor::new(u64::MAX - 0x10, 0x100, 1);
        assert!(!desc.contains(u64::MAX - 0x10, 1));
        assert!(desc.slice(0x20, 0x10).is_none());
        assert_eq!(desc.slice(0x8, 0x8).unwrap().addr, u64::MAX - 0x8);
    }
}
