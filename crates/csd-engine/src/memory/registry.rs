//! Memory registration: key assignment and remote-access checks.
//!
//! Every slab is registered once and receives a local key (used by the
//! owning side when posting) and a remote key (presented by a peer inside a
//! [`MemoryDescriptor`]). Remote reads and writes are resolved against this
//! table; an unknown key or an out-of-bounds range is a remote access error.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use csd_proto::MemoryDescriptor;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::slab::SlabRegion;
use crate::error::{EngineError, EngineResult};

const LKEY_TAG: u32 = 0x1;
const RKEY_TAG: u32 = 0x2;

/// Local and remote keys assigned to a registered region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryKeys {
    /// Local-access key
    pub lkey: u32,
    /// Remote-access key
    pub rkey: u32,
}

/// Registered regions indexed by remote key
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    regions: DashMap<u32, Arc<SlabRegion>>,
    next_id: AtomicU32,
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a region and assign its keys
    pub fn register(&self, region: Arc<SlabRegion>) -> MemoryKeys {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let keys = MemoryKeys {
            lkey: (id << 2) | LKEY_TAG,
            rkey: (id << 2) | RKEY_TAG,
        };
        debug!(
            "Registered region {:#x} (len={}, lkey={:#x}, rkey={:#x})",
            region.addr(),
            region.len(),
            keys.lkey,
            keys.rkey
        );
        self.regions.insert(keys.rkey, region);
        keys
    }

    /// Drop the registration for `rkey`
    pub fn deregister(&self, rkey: u32) -> bool {
        let removed = self.regions.remove(&rkey).is_some();
        if removed {
            debug!("Deregistered region rkey={:#x}", rkey);
        }
        removed
    }

    /// Number of registered regions
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether no region is registered
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn resolve(&self, desc: &MemoryDescriptor, len: usize) -> EngineResult<Arc<SlabRegion>> {
        let denied = || EngineError::RemoteAccess {
            key: desc.key,
            addr: desc.addr,
            len,
        };
        if len > desc.length as usize {
            warn!("Remote access of {} bytes exceeds descriptor {:?}", len, desc);
            return Err(denied());
        }
        let region = self
            .regions
            .get(&desc.key)
            .map(|entry| entry.value().clone())
            .ok_or_else(denied)?;
        if !region.contains(desc.addr, len) {
            warn!("Remote access outside registered region: {:?}", desc);
            return Err(denied());
        }
        Ok(region)
    }

    /// Copy `data` into the peer memory named by `desc`
    pub fn remote_write(&self, desc: &MemoryDescriptor, data: &[u8]) -> EngineResult<()> {
        let _region = self.resolve(desc, data.len())?;
        // SAFETY: the destination lies inside a live registered region (held
        // by `_region`), and the peer granted access by handing out `desc`.
        unsafe { ptr::copy(data.as_ptr(), desc.addr as *mut u8, data.len()) };
        Ok(())
    }

    /// Copy peer memory named by `desc` into `out`
    pub fn remote_read(&self, desc: &MemoryDescriptor, out: &mut [u8]) -> EngineResult<()> {
        let _region = self.resolve(desc, out.len())?;
        // SAFETY: as in `remote_write`, with the copy direction reversed.
        unsafe { ptr::copy(desc.addr as *const u8, out.as_mut_ptr(), out.len()) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_region() -> (MemoryRegistry, Arc<SlabRegion>, MemoryKeys) {
        let registry = MemoryRegistry::new();
        let region = Arc::new(SlabRegion::new(8192).unwrap());
        let keys = registry.register(region.clone());
        (registry, region, keys)
    }

    #[test]
    fn test_keys_are_distinct() {
        let registry = MemoryRegistry::new();
        let a = registry.register(Arc::new(SlabRegion::new(4096).unwrap()));
        let b = registry.register(Arc::new(SlabRegion::new(4096).unwrap()));
        assert_ne!(a.rkey, b.rkey);
        assert_ne!(a.lkey, a.rkey);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remote_write_then_read() {
        let (registry, region, keys) = registry_with_region();
        let desc = MemoryDescriptor::new(region.addr() + 100, 16, keys.rkey);

        registry.remote_write(&desc, b"remote bytes").unwrap();
        let mut out = [0u8; 12];
        registry.remote_read(&desc, &mut out).unwrap();
        assert_eq!(&out, b"remote bytes");
    }

    #[test]
    fn test_unknown_key_denied() {
        let (registry, region, keys) = registry_with_region();
        let desc = MemoryDescriptor::new(region.addr(), 16, keys.lkey);
        assert!(matches!(
            registry.remote_write(&desc, b"x"),
            Err(EngineError::RemoteAccess { .. })
        ));
    }

    #[test]
    fn test_out_of_bounds_denied() {
        let (registry, region, keys) = registry_with_region();

        // Past the end of the region.
        let desc = MemoryDescriptor::new(region.addr() + 8190, 16, keys.rkey);
        assert!(registry.remote_write(&desc, &[0u8; 4]).is_err());

        // Longer than the descriptor itself.
        let desc = MemoryDescriptor::new(region.addr(), 2, keys.rkey);
        assert!(registry.remote_write(&desc, &[0u8; 4]).is_err());
    }

    #[test]
    fn test_deregister() {
        let (registry, region, keys) = registry_with_region();
        assert!(registry.deregister(keys.rkey));
        assert!(!registry.deregister(keys.rkey));
        let desc = MemoryDescriptor::new(region.addr(), 1, keys.rkey);
        assert!(registry.remote_read(&desc, &mut [0u8; 1]).is_err());
    }
}
