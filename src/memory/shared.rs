//! Shared memory segment using Linux memfd.
//!
//! This is the raw backing store for everything that lives in shared memory.
//! A segment is created by one process and handed to others by passing its
//! file descriptor (see [`ipc`](super::ipc)). Every process maps it at its own
//! base address, which is why nothing stored inside may contain a pointer.

use crate::defaults::PAGE_SIZE;
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

/// A memory segment backed by Linux memfd (anonymous shared memory).
///
/// # Features
///
/// - Anonymous: No filesystem visibility (unlike `shm_open`)
/// - Auto-cleanup: Kernel reclaims memory when all mappings and fds are gone
/// - Zero-initialized: fresh memfd pages read as zero
///
/// # Example
///
/// ```rust,ignore
/// use shoal::memory::SharedMemorySegment;
///
/// let segment = SharedMemorySegment::new("my-segment", 1024 * 1024)?;
/// let fd = segment.try_clone_fd()?;
/// // Send fd over a Unix socket...
/// ```
pub struct SharedMemorySegment {
    /// The memfd file descriptor.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the segment.
    len: usize,
    /// Optional name (for debugging).
    name: Option<String>,
}

impl SharedMemorySegment {
    /// Create a new shared memory segment.
    ///
    /// # Arguments
    ///
    /// * `name` - Debug name for the segment (visible in `/proc/self/fd/`).
    /// * `size` - Size in bytes. Must be greater than 0.
    ///
    /// # Errors
    ///
    /// Returns an error if `memfd_create`, `ftruncate`, or `mmap` fails.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;

        rustix::fs::ftruncate(&fd, size as u64)?;

        // SAFETY: fd is a freshly sized memfd of `size` bytes.
        let ptr = unsafe { map_shared(&fd, size)? };

        Ok(Self {
            fd,
            ptr,
            len: size,
            name: Some(name.to_string()),
        })
    }

    /// Open an existing shared memory segment from a file descriptor.
    ///
    /// This is used by the receiving process after getting the fd via
    /// `SCM_RIGHTS`. A `size` of `None` maps the whole file.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `fd` refers to a shared memory object that
    /// other processes only access through the structures placed in it.
    pub unsafe fn from_fd(fd: OwnedFd, size: Option<usize>) -> Result<Self> {
        let size = match size {
            Some(size) => size,
            None => rustix::fs::fstat(&fd)?.st_size as usize,
        };
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        // SAFETY: caller guarantees fd is a shared memory object of at least `size` bytes.
        let ptr = unsafe { map_shared(&fd, size)? };

        Ok(Self {
            fd,
            ptr,
            len: size,
            name: None,
        })
    }

    /// Map a segment from a raw file descriptor without taking ownership.
    ///
    /// The fd is duplicated; the original stays open and owned by the caller.
    ///
    /// # Safety
    ///
    /// Same requirements as [`from_fd`](Self::from_fd), and `fd` must be open.
    pub unsafe fn from_raw_fd(fd: RawFd, size: Option<usize>) -> Result<Self> {
        let dup_fd = rustix::io::fcntl_dupfd_cloexec(unsafe { BorrowedFd::borrow_raw(fd) }, 0)?;
        unsafe { Self::from_fd(dup_fd, size) }
    }

    /// Duplicate the segment's file descriptor.
    ///
    /// Mapping the duplicate gives a second, independent view of the same
    /// physical pages, at a different address. This is what another process
    /// sees after receiving the fd.
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        Ok(rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?)
    }

    /// Get the raw file descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Pointer to the first byte of this process's mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the segment in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the segment has zero length (never, by construction).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the debug name of this segment.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Pre-fault the memory to avoid page faults during use.
    pub fn prefault(&self) {
        let ptr = self.ptr.as_ptr();
        for offset in (0..self.len).step_by(PAGE_SIZE) {
            // SAFETY: offset < len, inside the mapping.
            unsafe {
                std::ptr::read_volatile(ptr.add(offset));
            }
        }
    }
}

/// Map `size` bytes of `fd` read-write and shared.
///
/// # Safety
///
/// `fd` must be a mappable object of at least `size` bytes.
unsafe fn map_shared(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };

    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe exactly the mapping created in new/from_fd.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: SharedMemorySegment is Send + Sync because:
// - The memory is shared and can be accessed from any thread
// - The fd is reference-counted by the kernel
// - We don't hold any thread-local state
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for SharedMemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemorySegment")
            .field("fd", &self.fd.as_raw_fd())
            .field("len", &self.len)
            .field("name", &self.name)
            .finish()
    }
}
