// Copyright 2020 Joyent, Inc.

//! Byte buffers for the binary codec.
//!
//! An [`Allocator`] is a policy-free source and sink of buffers. A
//! [`BufferPool`] layers a reuse policy on top of one so that reading and
//! writing frames does not allocate for every message.

use std::fmt;
use std::ops::{Deref, DerefMut};

#[cfg(target_os = "linux")]
use crate::mapped::MappedRegion;

enum Storage {
    Heap(Box<[u8]>),
    #[cfg(target_os = "linux")]
    Mapped(MappedRegion),
}

/// A byte buffer of a fixed capacity, exposing `len()` bytes.
pub struct Buffer {
    storage: Storage,
    len: usize,
}

impl Buffer {
    pub fn heap(size: usize) -> Buffer {
        Buffer {
            storage: Storage::Heap(vec![0; size].into_boxed_slice()),
            len: size,
        }
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn mapped(region: MappedRegion, len: usize) -> Buffer {
        Buffer {
            storage: Storage::Mapped(region),
            len,
        }
    }

    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Heap(bytes) => bytes.len(),
            #[cfg(target_os = "linux")]
            Storage::Mapped(region) => region.len(),
        }
    }

    /// Re-advertise the buffer with a new length, keeping its storage.
    ///
    /// Panics if `len` exceeds the capacity.
    pub fn with_len(mut self, len: usize) -> Buffer {
        assert!(
            len <= self.capacity(),
            "buffer length {} exceeds capacity {}",
            len,
            self.capacity()
        );
        self.len = len;
        self
    }

    pub fn is_mapped(&self) -> bool {
        match &self.storage {
            Storage::Heap(_) => false,
            #[cfg(target_os = "linux")]
            Storage::Mapped(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn into_region(self) -> Option<MappedRegion> {
        match self.storage {
            Storage::Mapped(region) => Some(region),
            Storage::Heap(_) => None,
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.storage {
            Storage::Heap(bytes) => &bytes[..self.len],
            #[cfg(target_os = "linux")]
            Storage::Mapped(region) => &region.as_slice()[..self.len],
        }
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match &mut self.storage {
            Storage::Heap(bytes) => &mut bytes[..len],
            #[cfg(target_os = "linux")]
            Storage::Mapped(region) => &mut region.as_mut_slice()[..len],
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Source and sink of raw buffers.
///
/// `allocate(size)` hands out a buffer of exactly `size` bytes whose content
/// is unspecified. `dispose` takes ownership back; the allocator may reuse or
/// free it.
pub trait Allocator {
    fn allocate(&mut self, size: usize) -> Buffer;
    fn dispose(&mut self, buffer: Buffer);
}

/// An allocator with a reuse policy, owned by a single codec.
pub trait BufferPool: Allocator {
    /// Return every retained buffer to the backing allocator.
    fn close(&mut self);
}

impl<A: Allocator + ?Sized> Allocator for Box<A> {
    fn allocate(&mut self, size: usize) -> Buffer {
        (**self).allocate(size)
    }

    fn dispose(&mut self, buffer: Buffer) {
        (**self).dispose(buffer)
    }
}

impl<P: BufferPool + ?Sized> BufferPool for Box<P> {
    fn close(&mut self) {
        (**self).close()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn allocate(&mut self, size: usize) -> Buffer {
        Buffer::heap(size)
    }

    fn dispose(&mut self, _buffer: Buffer) {}
}

/// No pooling: every request goes to the heap.
impl BufferPool for HeapAllocator {
    fn close(&mut self) {}
}

/// A bounded free list of buffers that are all the same size.
pub struct FixedPool<A> {
    allocator: A,
    size: usize,
    capacity: usize,
    free: Vec<Buffer>,
}

impl<A: Allocator> FixedPool<A> {
    pub fn new(allocator: A, size: usize, capacity: usize) -> FixedPool<A> {
        FixedPool {
            allocator,
            size,
            capacity,
            free: Vec::with_capacity(capacity),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl<A: Allocator> Allocator for FixedPool<A> {
    fn allocate(&mut self, size: usize) -> Buffer {
        if size != self.size {
            panic!(
                "fixed buffer pool of {} byte buffers asked for {} bytes",
                self.size, size
            );
        }
        match self.free.pop() {
            Some(buffer) => buffer,
            None => self.allocator.allocate(size),
        }
    }

    fn dispose(&mut self, buffer: Buffer) {
        if self.free.len() == self.capacity {
            self.allocator.dispose(buffer);
            return;
        }
        let size = self.size;
        self.free.push(buffer.with_len(size));
    }
}

impl<A: Allocator> BufferPool for FixedPool<A> {
    fn close(&mut self) {
        while let Some(buffer) = self.free.pop() {
            self.allocator.dispose(buffer);
        }
    }
}

/// Caches the largest buffer seen so far.
pub struct SinglePool<A> {
    allocator: A,
    cached: Option<Buffer>,
}

impl<A: Allocator> SinglePool<A> {
    pub fn new(allocator: A) -> SinglePool<A> {
        SinglePool {
            allocator,
            cached: None,
        }
    }

    /// Capacity of the cached buffer, if any.
    pub fn cached_capacity(&self) -> Option<usize> {
        self.cached.as_ref().map(Buffer::capacity)
    }
}

impl<A: Allocator> Allocator for SinglePool<A> {
    fn allocate(&mut self, size: usize) -> Buffer {
        match self.cached.take() {
            Some(cached) if cached.capacity() >= size => cached.with_len(size),
            Some(cached) => {
                self.allocator.dispose(cached);
                self.allocator.allocate(size)
            }
            None => self.allocator.allocate(size),
        }
    }

    fn dispose(&mut self, buffer: Buffer) {
        let capacity = buffer.capacity();
        let buffer = buffer.with_len(capacity);
        match self.cached.take() {
            None => self.cached = Some(buffer),
            Some(cached) if cached.capacity() >= capacity => {
                self.allocator.dispose(buffer);
                self.cached = Some(cached);
            }
            Some(cached) => {
                self.allocator.dispose(cached);
                self.cached = Some(buffer);
            }
        }
    }
}

impl<A: Allocator> BufferPool for SinglePool<A> {
    fn close(&mut self) {
        if let Some(cached) = self.cached.take() {
            self.allocator.dispose(cached);
        }
    }
}
