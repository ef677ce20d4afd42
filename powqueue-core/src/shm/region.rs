//! SharedRegion - POSIX shared memory wrapper.
//!
//! Provides safe abstraction over shm_open and mmap for the request ring.
//! All unsafe operations are encapsulated here; the ring only sees a base
//! pointer, a size, and the flush/invalidate visibility barrier.

use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

use crate::error::SharedMemoryError;

/// Represents a mapped shared memory region.
///
/// This struct owns the mapping and unmaps it on drop. The owning instance
/// (the creator, or a server that adopted an existing region) also unlinks
/// the name on drop.
pub struct SharedRegion {
    /// Name of the shared memory object (without the leading slash).
    name: String,
    /// Pointer to the mapped memory.
    ptr: NonNull<u8>,
    /// Size of the mapped region in bytes.
    size: usize,
    /// Whether this instance should unlink the object when dropped.
    is_owner: bool,
}

// SAFETY: SharedRegion owns its mapping; it can move between threads.
unsafe impl Send for SharedRegion {}

// SAFETY: all concurrent access to the mapped bytes goes through the
// process-shared locks stored inside the region.
unsafe impl Sync for SharedRegion {}

fn object_name(name: &str) -> Result<CString, String> {
    if name.is_empty() {
        return Err("Name cannot be empty".to_string());
    }
    CString::new(format!("/{}", name)).map_err(|e| format!("Invalid name: {}", e))
}

impl SharedRegion {
    /// Maximum size for a shared memory region (1 GB).
    pub const MAX_SIZE: usize = 1024 * 1024 * 1024;

    /// Create a new, zero-filled shared memory object and map it.
    ///
    /// # Errors
    /// `AlreadyExists` if the name is taken, `Allocation` if the object cannot
    /// be created, `Resource` if it cannot be sized or mapped (the partially
    /// created object is unlinked).
    pub fn create(name: &str, size: usize) -> Result<Self, SharedMemoryError> {
        if size == 0 || size > Self::MAX_SIZE {
            return Err(SharedMemoryError::Allocation {
                name: name.to_string(),
                reason: format!("Size {} must be between 1 and {}", size, Self::MAX_SIZE),
            });
        }

        let c_name = object_name(name).map_err(|reason| SharedMemoryError::Allocation {
            name: name.to_string(),
            reason,
        })?;

        // SAFETY: c_name is a valid CString, flags are valid POSIX flags
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600 as libc::mode_t,
            )
        };

        if fd < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EEXIST) {
                return Err(SharedMemoryError::AlreadyExists {
                    name: name.to_string(),
                });
            }
            return Err(SharedMemoryError::Allocation {
                name: name.to_string(),
                reason: format!("shm_open failed: {}", errno),
            });
        }

        // SAFETY: fd is a valid file descriptor
        let result = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if result < 0 {
            let errno = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(SharedMemoryError::Resource {
                name: name.to_string(),
                reason: format!("ftruncate failed: {}", errno),
            });
        }

        let ptr = match Self::map(fd, size) {
            Ok(ptr) => ptr,
            Err(errno) => {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(SharedMemoryError::Resource {
                    name: name.to_string(),
                    reason: format!("mmap failed: {}", errno),
                });
            }
        };

        // SAFETY: ptr is valid for size bytes and nobody else has seen it yet
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, size);
        }

        tracing::debug!(name = %name, size = size, "Created shared memory region");

        Ok(Self {
            name: name.to_string(),
            ptr,
            size,
            is_owner: true,
        })
    }

    /// Map an existing shared memory object at its current size.
    ///
    /// # Errors
    /// `NotFound` if no object has this name.
    pub fn attach(name: &str) -> Result<Self, SharedMemoryError> {
        let c_name = object_name(name).map_err(|_| SharedMemoryError::NotFound {
            name: name.to_string(),
        })?;

        // SAFETY: c_name is a valid CString
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };

        if fd < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::ENOENT) {
                return Err(SharedMemoryError::NotFound {
                    name: name.to_string(),
                });
            }
            return Err(SharedMemoryError::Resource {
                name: name.to_string(),
                reason: format!("shm_open failed: {}", errno),
            });
        }

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fd is valid and stat is a valid out pointer
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } < 0 {
            let errno = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(SharedMemoryError::Resource {
                name: name.to_string(),
                reason: format!("fstat failed: {}", errno),
            });
        }
        // SAFETY: fstat succeeded
        let size = unsafe { stat.assume_init() }.st_size as usize;

        if size == 0 {
            unsafe { libc::close(fd) };
            return Err(SharedMemoryError::Incompatible {
                name: name.to_string(),
                reason: "object has zero size".to_string(),
            });
        }

        let ptr = Self::map(fd, size).map_err(|errno| SharedMemoryError::Resource {
            name: name.to_string(),
            reason: format!("mmap failed: {}", errno),
        })?;

        tracing::debug!(name = %name, size = size, "Attached shared memory region");

        Ok(Self {
            name: name.to_string(),
            ptr,
            size,
            is_owner: false,
        })
    }

    /// Map `fd` read/write shared and close it; the mapping keeps the object
    /// alive.
    fn map(fd: libc::c_int, size: usize) -> Result<NonNull<u8>, std::io::Error> {
        // SAFETY: fd is valid, offset 0 is valid
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let errno = std::io::Error::last_os_error();
        // SAFETY: fd is no longer needed after mmap
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(errno);
        }
        NonNull::new(ptr as *mut u8)
            .ok_or_else(|| std::io::Error::other("mmap returned null"))
    }

    /// Remove a shared memory object by name without mapping it.
    pub fn unlink(name: &str) -> Result<(), SharedMemoryError> {
        let c_name = object_name(name).map_err(|_| SharedMemoryError::NotFound {
            name: name.to_string(),
        })?;
        // SAFETY: c_name is a valid CString
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::ENOENT) {
                return Err(SharedMemoryError::NotFound {
                    name: name.to_string(),
                });
            }
            return Err(SharedMemoryError::Resource {
                name: name.to_string(),
                reason: format!("shm_unlink failed: {}", errno),
            });
        }
        tracing::debug!(name = %name, "Unlinked shared memory region");
        Ok(())
    }

    /// Make this handle responsible for unlinking the object.
    pub fn adopt(&mut self) {
        self.is_owner = true;
    }

    /// Unmap and unlink. Every other process's mapping of this name becomes
    /// orphaned; only call this when no client is still attached.
    pub fn destroy(mut self) {
        self.is_owner = true;
        drop(self);
    }

    /// Get the name of this shared memory region.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of this shared memory region.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Get a raw pointer to the shared memory.
    ///
    /// Callers must hold the lock governing whatever they touch.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Publish local writes: full fence, then synchronous write-back of the
    /// whole region with invalidation of other mappings.
    pub fn flush(&self) -> Result<(), SharedMemoryError> {
        fence(Ordering::SeqCst);
        self.msync(libc::MS_SYNC | libc::MS_INVALIDATE, "flush")
    }

    /// Drop any stale local view before reading shared state.
    pub fn invalidate(&self) -> Result<(), SharedMemoryError> {
        self.msync(libc::MS_INVALIDATE, "invalidate")?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn msync(&self, flags: libc::c_int, op: &'static str) -> Result<(), SharedMemoryError> {
        // SAFETY: ptr/size describe our own page-aligned mapping
        let result =
            unsafe { libc::msync(self.ptr.as_ptr() as *mut libc::c_void, self.size, flags) };
        if result < 0 {
            return Err(SharedMemoryError::Barrier {
                op,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and size were set during creation
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size) };
        if result < 0 {
            tracing::error!(
                name = %self.name,
                error = %std::io::Error::last_os_error(),
                "Failed to unmap shared memory"
            );
        }

        if self.is_owner {
            if let Err(e) = Self::unlink(&self.name) {
                tracing::warn!(name = %self.name, error = %e, "Failed to unlink shared memory");
            }
        }
    }
}
