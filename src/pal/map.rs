//! Raw memory mapping underneath the allocation layer.

use crate::error::{Error, Result};
use std::{fs::OpenOptions, os::unix::io::AsRawFd, path::Path, ptr};

/// A fixed-size mapping, file-backed for durable pools or anonymous for
/// throwaway ones. The base address never changes for the lifetime of the
/// mapping.
pub(crate) struct Mapping {
    base: *mut u8,
    len: usize,
    file: Option<std::fs::File>,
}

// The mapping is plain memory; all synchronisation happens above it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub(crate) fn file(path: &Path, len: usize) -> Result<Mapping> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|_| Error::Inval)?;
        // sparse file; pages materialise on first store
        if unsafe { libc::ftruncate(file.as_raw_fd(), len as libc::off_t) } != 0 {
            return Err(Error::Nomem);
        }
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Nomem);
        }
        Ok(Mapping {
            base: base as *mut u8,
            len,
            file: Some(file),
        })
    }

    pub(crate) fn anon(len: usize) -> Result<Mapping> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Nomem);
        }
        Ok(Mapping {
            base: base as *mut u8,
            len,
            file: None,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    /// Flush the whole mapping to its backing file. No-op for anonymous
    /// mappings.
    pub(crate) fn sync(&self) {
        if self.file.is_some() {
            let rc = unsafe { libc::msync(self.base as *mut libc::c_void, self.len, libc::MS_SYNC) };
            if rc != 0 {
                log::warn!("msync failed, pool contents may lag the heap");
            }
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        self.sync();
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}
