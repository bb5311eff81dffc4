//! Anonymous shared mappings.
//!
//! Memory mapped here with `MAP_SHARED | MAP_ANONYMOUS` is zeroed by the
//! kernel and remains shared with every process forked afterwards. Each
//! process unmaps its own view on drop; the pages go away once the last
//! process has done so.

use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use swarm_common::{Error, Result};

/// Types for which the all-zero byte pattern is a valid, ready-to-use value.
///
/// # Safety
///
/// Implementors must be valid when every byte is zero and must only use
/// interior mutability that is sound across processes (atomics, not
/// `Cell`/`RefCell`/heap pointers).
pub unsafe trait ZeroInit: Sync {}

unsafe impl ZeroInit for std::sync::atomic::AtomicU8 {}
unsafe impl ZeroInit for std::sync::atomic::AtomicU32 {}
unsafe impl ZeroInit for std::sync::atomic::AtomicU64 {}
unsafe impl ZeroInit for std::sync::atomic::AtomicI32 {}
unsafe impl<T: ZeroInit, const N: usize> ZeroInit for [T; N] {}

/// An owned `MAP_SHARED | MAP_ANONYMOUS` mapping.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory; synchronisation is up to whatever lives in it.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Maps `len` zeroed bytes shared across `fork`.
    ///
    /// Fails with `ResourceExhausted` when the kernel refuses the mapping.
    pub fn new(len: usize) -> Result<Self> {
        let len = len.max(1);
        // Safety: anonymous mapping, no fd, kernel picks the address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::resource_exhausted(
                format!("shared region of {} bytes", len),
                std::io::Error::last_os_error().to_string(),
            ));
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| Error::resource_exhausted("shared region", "mmap returned null"))?;
        tracing::trace!(len, "mapped shared region");
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Unmaps the region, reporting a failed `munmap` instead of ignoring it.
    pub fn unmap(self) -> Result<()> {
        let this = std::mem::ManuallyDrop::new(self);
        // Safety: ptr/len came from a successful mmap and are unmapped once.
        let rc = unsafe { libc::munmap(this.ptr.as_ptr() as *mut libc::c_void, this.len) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // Safety: see `unmap`.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if rc != 0 {
            tracing::warn!(
                "munmap of {} byte shared region failed: {}",
                self.len,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// A `T` living in its own shared mapping.
///
/// Derefs to `&T`; all mutation goes through `T`'s atomics.
#[derive(Debug)]
pub struct Shared<T: ZeroInit> {
    region: SharedRegion,
    _marker: PhantomData<T>,
}

impl<T: ZeroInit> Shared<T> {
    /// Maps a zeroed `T`.
    pub fn new() -> Result<Self> {
        // mmap returns page-aligned memory.
        debug_assert!(std::mem::align_of::<T>() <= 4096);
        let region = SharedRegion::new(std::mem::size_of::<T>())?;
        Ok(Self {
            region,
            _marker: PhantomData,
        })
    }

    /// Unmaps the value, reporting `munmap` failures.
    pub fn unmap(self) -> Result<()> {
        self.region.unmap()
    }
}

impl<T: ZeroInit> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the region is at least size_of::<T>() bytes, page aligned,
        // zero-initialised, and T is valid when zeroed.
        unsafe { &*(self.region.as_ptr() as *const T) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_region_is_zeroed() {
        let region = SharedRegion::new(4096).unwrap();
        assert_eq!(region.len(), 4096);
        for i in 0..region.len() {
            assert_eq!(unsafe { *region.as_ptr().add(i) }, 0);
        }
    }

    #[test]
    fn test_zero_length_is_rounded_up() {
        let region = SharedRegion::new(0).unwrap();
        assert_eq!(region.len(), 1);
    }

    #[test]
    fn test_shared_value_roundtrip() {
        let shared: Shared<[AtomicU64; 8]> = Shared::new().unwrap();
        shared[3].store(7, Ordering::Relaxed);
        assert_eq!(shared[3].load(Ordering::Relaxed), 7);
        assert_eq!(shared[0].load(Ordering::Relaxed), 0);
        shared.unmap().unwrap();
    }

    #[test]
    fn test_absurd_size_is_resource_exhausted() {
        let err = SharedRegion::new(usize::MAX / 2).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, Error::ResourceExhausted { .. }));
    }
}
