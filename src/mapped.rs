// Copyright 2020 Joyent, Inc.

//! Anonymous private page mappings as buffer storage (Linux only).

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::slice;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::pool::{Allocator, Buffer, BufferPool};

pub(crate) struct MappedRegion {
    ptr: NonNull<c_void>,
    len: usize,
}

impl MappedRegion {
    fn map(len: NonZeroUsize) -> MappedRegion {
        // SAFETY: an anonymous private mapping aliases no existing memory.
        let mapping = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        };
        match mapping {
            Ok(ptr) => MappedRegion {
                ptr,
                len: len.get(),
            },
            Err(e) => panic!("mmap of {} bytes failed: {}", len, e),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is mapped readable for `len` bytes until drop.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the region is mapped writable and uniquely owned.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) }
    }

    fn unmap(self) {
        let (ptr, len) = (self.ptr, self.len);
        std::mem::forget(self);
        // SAFETY: the pointer came from mmap with this length and is not
        // referenced after this call.
        if let Err(e) = unsafe { munmap(ptr, len) } {
            panic!("munmap of {} bytes failed: {}", len, e);
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: as in `unmap`; errors cannot be reported from drop.
        let _ = unsafe { munmap(self.ptr, self.len) };
    }
}

/// Backs every buffer with its own page mapping.
///
/// Mapping or unmapping failures panic: the process cannot continue without
/// the memory it asked for.
#[derive(Debug, Default, Clone, Copy)]
pub struct MappedAllocator;

impl Allocator for MappedAllocator {
    fn allocate(&mut self, size: usize) -> Buffer {
        // Zero-length mappings are rejected by the kernel.
        let len = NonZeroUsize::new(size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Buffer::mapped(MappedRegion::map(len), size)
    }

    fn dispose(&mut self, buffer: Buffer) {
        if let Some(region) = buffer.into_region() {
            region.unmap();
        }
    }
}

impl BufferPool for MappedAllocator {
    fn close(&mut self) {}
}
