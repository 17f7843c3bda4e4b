//! POSIX shared-memory mappings.
//!
//! A [`SharedMemory`] is a named `shm_open` + `mmap` region. Whoever is
//! handed the *remove on close* flag unlinks the OS name when its handle
//! drops; for device segments that is deliberately the opposite side from
//! the one that created them.

use crate::IpcError;
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// A mapped shared memory region.
pub struct SharedMemory {
    fd: RawFd,
    ptr: NonNull<u8>,
    size: usize,
    name: String,
    remove_on_drop: bool,
}

/// POSIX shm names must start with exactly one slash.
fn os_name(name: &str) -> Result<CString, IpcError> {
    let full = if name.starts_with('/') { name.to_string() } else { format!("/{name}") };
    CString::new(full).map_err(|e| IpcError::Shm(format!("invalid shm name {name:?}: {e}")))
}

impl SharedMemory {
    /// Create a new region. Fails if a region with this name already exists.
    pub fn create(name: &str, size: usize, remove_on_drop: bool) -> Result<Self, IpcError> {
        let c_name = os_name(name)?;
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(IpcError::Shm(format!(
                "failed to create shared memory {name:?}: {}",
                io::Error::last_os_error()
            )));
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(IpcError::Shm(format!(
                "failed to size shared memory {name:?} to {size} bytes: {err}"
            )));
        }
        Self::map(fd, c_name, name, size, remove_on_drop)
    }

    /// Open an existing region of known size.
    pub fn open(name: &str, size: usize, remove_on_drop: bool) -> Result<Self, IpcError> {
        let c_name = os_name(name)?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(IpcError::Shm(format!(
                "failed to open shared memory {name:?}: {}",
                io::Error::last_os_error()
            )));
        }
        Self::map(fd, c_name, name, size, remove_on_drop)
    }

    fn map(
        fd: RawFd,
        c_name: CString,
        name: &str,
        size: usize,
        remove_on_drop: bool,
    ) -> Result<Self, IpcError> {
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
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                if remove_on_drop {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
            return Err(IpcError::Shm(format!("failed to map shared memory {name:?}: {err}")));
        }
        // mmap never returns null on success.
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| IpcError::Shm(format!("null mapping for {name:?}")))?;
        Ok(Self { fd, ptr, size, name: name.to_string(), remove_on_drop })
    }

    /// Get a typed reference into the region.
    ///
    /// # Safety
    ///
    /// `T` must match what the region actually holds, the region must be at
    /// least `size_of::<T>()` bytes, and all cross-process access must be
    /// synchronized through atomics or the layout's interior locks.
    pub unsafe fn as_ref<T>(&self) -> &T {
        debug_assert!(std::mem::size_of::<T>() <= self.size);
        unsafe { &*self.ptr.as_ptr().cast::<T>() }
    }

    /// Raw base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.size);
            libc::close(self.fd);
            if self.remove_on_drop {
                if let Ok(c_name) = os_name(&self.name) {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

// Shared memory is explicitly designed to be shared between processes.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("sp-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn test_create_and_open() {
        let name = unique_name("shm");
        let size = 4096;

        let creator = SharedMemory::create(&name, size, true).expect("create shm");
        assert_eq!(creator.size(), size);

        unsafe {
            let bytes = creator.as_ptr();
            *bytes = 42;
            *bytes.add(100) = 123;
        }

        let reader = SharedMemory::open(&name, size, false).expect("open shm");
        unsafe {
            let data: &[u8; 4096] = reader.as_ref();
            assert_eq!(data[0], 42);
            assert_eq!(data[100], 123);
        }
    }

    #[test]
    fn test_create_refuses_existing_name() {
        let name = unique_name("dup");
        let _a = SharedMemory::create(&name, 128, true).expect("create shm");
        assert!(SharedMemory::create(&name, 128, false).is_err());
    }

    #[test]
    fn test_remove_on_drop_unlinks_name() {
        let name = unique_name("unlink");
        drop(SharedMemory::create(&name, 128, true).expect("create shm"));
        assert!(SharedMemory::open(&name, 128, false).is_err());
    }
}
