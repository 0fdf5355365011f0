//! Message buffer management.
//!
//! `MsgBuffer` is a contiguous, cache-line-aligned byte region that can be
//! registered with a transport through its memory-registration hooks.
//! `BufferPool` keeps a preallocated, index-addressed set of buffers for
//! hot-path allocation without hitting the system allocator.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::transport::MemRegInfo;

/// Alignment for message buffers (cache line).
pub const MSG_BUFFER_ALIGN: usize = 64;

/// A message buffer usable by the transport.
///
/// The buffer owns its memory. Registration state is an opaque token issued
/// by the transport's `reg_mr` hook; transports that need no registration
/// hand out a default token.
pub struct MsgBuffer {
    /// Pointer to the allocated memory.
    ptr: NonNull<u8>,
    /// Total capacity of the buffer.
    capacity: usize,
    /// Current length of valid data.
    len: usize,
    /// Transport registration token, if registered.
    reg: Option<MemRegInfo>,
}

impl MsgBuffer {
    /// Create a new unregistered message buffer with the given capacity.
    /// The length starts equal to the capacity.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("buffer capacity cannot be 0".into()));
        }

        let layout = Layout::from_size_align(capacity, MSG_BUFFER_ALIGN)
            .map_err(|_| Error::InvalidArgument("invalid buffer layout".into()))?;

        let ptr = unsafe {
            let ptr = alloc(layout);
            if ptr.is_null() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "failed to allocate buffer",
                )));
            }
            NonNull::new_unchecked(ptr)
        };

        Ok(Self {
            ptr,
            capacity,
            len: capacity,
            reg: None,
        })
    }

    /// Create a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let mut buf = Self::new(data.len())?;
        buf.as_mut_slice().copy_from_slice(data);
        Ok(buf)
    }

    /// Create a zero-capacity buffer, used for error completions that carry
    /// no payload.
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            capacity: 0,
            len: 0,
            reg: None,
        }
    }

    /// Attach a registration token issued by a transport.
    pub fn set_reg(&mut self, reg: MemRegInfo) {
        self.reg = Some(reg);
    }

    /// Take the registration token, leaving the buffer unregistered.
    pub fn take_reg(&mut self) -> Option<MemRegInfo> {
        self.reg.take()
    }

    /// Check if the buffer is registered.
    #[inline]
    pub fn is_registered(&self) -> bool {
        self.reg.is_some()
    }

    /// Get a pointer to the buffer data.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get a mutable pointer to the buffer data.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the total capacity of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the current length of valid data.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer holds no valid data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the length of valid data.
    ///
    /// # Panics
    /// Panics if `len > capacity`.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity);
        self.len = len;
    }

    /// Get the buffer contents as a byte slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get the buffer contents as a mutable byte slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy data into the buffer, setting the length.
    pub fn copy_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity {
            return Err(Error::BufferTooSmall {
                required: data.len(),
                available: self.capacity,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), data.len());
        }
        self.len = data.len();
        Ok(())
    }

    /// Shrink or grow the valid length within the allocated capacity.
    ///
    /// Registration survives because the underlying region is untouched.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.capacity {
            return Err(Error::MessageTooLarge {
                size: new_len,
                max: self.capacity,
            });
        }
        self.len = new_len;
        Ok(())
    }
}

impl Drop for MsgBuffer {
    fn drop(&mut self) {
        if self.capacity == 0 {
            return;
        }
        let layout = Layout::from_size_align(self.capacity, MSG_BUFFER_ALIGN).unwrap();
        unsafe {
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl std::fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("registered", &self.is_registered())
            .finish()
    }
}

// Safety: MsgBuffer owns its memory; the registration token is plain data.
unsafe impl Send for MsgBuffer {}

/// A pool of preallocated message buffers.
pub struct BufferPool {
    buffers: Vec<Option<MsgBuffer>>,
    free_list: Vec<usize>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a new pool of `count` buffers of `buffer_size` bytes each.
    pub fn new(count: usize, buffer_size: usize) -> Result<Self> {
        let mut buffers = Vec::with_capacity(count);
        let mut free_list = Vec::with_capacity(count);

        for i in 0..count {
            buffers.push(Some(MsgBuffer::new(buffer_size)?));
            free_list.push(i);
        }

        Ok(Self {
            buffers,
            free_list,
            buffer_size,
        })
    }

    /// Take a buffer out of the pool.
    ///
    /// Falls back to a fresh allocation when the pool is exhausted, so the
    /// caller never stalls on pool pressure.
    pub fn take(&mut self) -> Result<(Option<usize>, MsgBuffer)> {
        if let Some(idx) = self.free_list.pop() {
            let buf = self.buffers[idx].take().expect("free list points at taken buffer");
            Ok((Some(idx), buf))
        } else {
            Ok((None, MsgBuffer::new(self.buffer_size)?))
        }
    }

    /// Return a pool buffer to its slot. Overflow buffers are just dropped.
    pub fn put(&mut self, idx: Option<usize>, mut buf: MsgBuffer) {
        if let Some(idx) = idx {
            debug_assert!(idx < self.buffers.len());
            debug_assert!(self.buffers[idx].is_none());
            buf.set_len(buf.capacity());
            self.buffers[idx] = Some(buf);
            self.free_list.push(idx);
        }
    }

    /// Number of available pool buffers.
    #[inline]
    pub fn available(&self) -> usize {
        self.free_list.len()
    }

    /// Total pool size.
    #[inline]
    pub fn total(&self) -> usize {
        self.buffers.len()
    }

    /// Size of each pooled buffer.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
