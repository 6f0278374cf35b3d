// This module owns the memory that linked code and data live in. MemoryRegion maps anonymous
// read+write pages with libc::mmap, lets the linker copy section contents in and patch
// relocations, and then switches the pages to their final protection with mprotect: code
// becomes read+execute and is never writable and executable at the same time. Regions are
// unmapped when dropped, which is how removing a module releases its executable memory.
// Zero-sized regions never touch the OS.

//! Page-granular memory for linked code and data.

use std::ptr::NonNull;
use thiserror::Error;

/// Failure to map or protect memory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("mmap of {size} bytes failed (errno {errno})")]
    Map { size: usize, errno: i32 },

    #[error("mprotect to {protection:?} failed (errno {errno})")]
    Protect { protection: Protection, errno: i32 },

    #[error("write of {len} bytes at offset {offset} exceeds region of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("region is no longer writable")]
    NotWritable,
}

/// Page protection states a region moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadExecute,
    ReadOnly,
}

impl Protection {
    fn flags(self) -> libc::c_int {
        match self {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadOnly => libc::PROT_READ,
        }
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// An mmap'd range of pages.
#[derive(Debug)]
pub struct MemoryRegion {
    ptr: Option<NonNull<u8>>,
    /// Requested size in bytes.
    size: usize,
    /// Mapped size, a multiple of the page size.
    mapped: usize,
    protection: Protection,
}

// SAFETY: the region exclusively owns its mapping; mutation requires `&mut self`.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Map `size` bytes of zeroed read+write memory.
    pub fn allocate(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Ok(Self {
                ptr: None,
                size: 0,
                mapped: 0,
                protection: Protection::ReadWrite,
            });
        }
        let page = page_size();
        let mapped = size.div_ceil(page) * page;
        // SAFETY: anonymous private mapping with no address hint.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                Protection::ReadWrite.flags(),
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(MemoryError::Map {
                size: mapped,
                errno: errno(),
            });
        }
        log::trace!("mapped {mapped} bytes at {raw:p}");
        Ok(Self {
            ptr: NonNull::new(raw as *mut u8),
            size,
            mapped,
            protection: Protection::ReadWrite,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Base address, 0 for empty regions.
    pub fn base(&self) -> u64 {
        self.ptr.map_or(0, |p| p.as_ptr() as u64)
    }

    pub fn contains(&self, addr: u64) -> bool {
        let base = self.base();
        self.size > 0 && addr >= base && addr < base + self.size as u64
    }

    /// Copy `bytes` to `offset`; only valid while read+write.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        if self.protection != Protection::ReadWrite {
            return Err(MemoryError::NotWritable);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let end = offset.checked_add(bytes.len());
        let Some(ptr) = self.ptr.filter(|_| end.is_some_and(|end| end <= self.size)) else {
            return Err(MemoryError::OutOfBounds {
                offset,
                len: bytes.len(),
                size: self.size,
            });
        };
        // SAFETY: bounds checked above and the mapping is writable.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Read back bytes, for inspection and tests.
    pub fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let ptr = self.ptr?;
        if offset.checked_add(len)? > self.size {
            return None;
        }
        // SAFETY: in bounds and every protection state allows reads.
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr().add(offset), len) })
    }

    /// Change the protection of the whole region.
    pub fn protect(&mut self, protection: Protection) -> Result<(), MemoryError> {
        if let Some(ptr) = self.ptr {
            // SAFETY: the range is exactly our mapping.
            let rc = unsafe {
                libc::mprotect(ptr.as_ptr() as *mut libc::c_void, self.mapped, protection.flags())
            };
            if rc != 0 {
                return Err(MemoryError::Protect {
                    protection,
                    errno: errno(),
                });
            }
        }
        self.protection = protection;
        Ok(())
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: unmapping the mapping created in `allocate`.
            let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, self.mapped) };
            if rc != 0 {
                log::warn!("munmap of {} bytes at {:p} failed", self.mapped, ptr.as_ptr());
            }
        }
    }
}
