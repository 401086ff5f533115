//! A bank is one big contiguous memory region from which page pools are
//! carved. Backing is either the global allocator or a hugepage-backed
//! shared mapping; the region is released when the bank is dropped.

use std::alloc::{self, Layout};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, info};

/// Backing kind of a [`MemoryBank`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankBacking {
    /// Plain allocation from the global allocator.
    Malloc,
    /// File created in a hugetlbfs mount, mapped shared.
    HugePage { path: PathBuf },
}

/// Alignment of malloc-backed banks. Generous so that pool alignment
/// requests are usually satisfiable without losing a page.
const BANK_ALIGN: usize = 4096;

/// One contiguous, process-lifetime memory region.
pub struct MemoryBank {
    base: NonNull<u8>,
    size: usize,
    backing: BankBacking,
    description: String,
}

// The bank only hands out raw sub-ranges; concurrent access discipline is
// enforced by the pools carved from it.
unsafe impl Send for MemoryBank {}
unsafe impl Sync for MemoryBank {}

impl MemoryBank {
    /// Allocates a bank from the global allocator.
    pub fn new_malloc(size: usize, description: &str) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::other("bank size must be non-zero"));
        }
        let layout = Layout::from_size_align(size, BANK_ALIGN)
            .map_err(|e| io::Error::other(format!("bad bank layout: {}", e)))?;
        // SAFETY: layout has non-zero size, checked above.
        let ptr = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(ptr).ok_or_else(|| io::Error::other("bank allocation failed"))?;
        info!("created malloc bank '{}': {} bytes", description, size);
        Ok(Self {
            base,
            size,
            backing: BankBacking::Malloc,
            description: description.to_string(),
        })
    }

    /// Creates a file of `size` bytes in a hugetlbfs mount and maps it
    /// shared. The file is unlinked and unmapped on drop.
    pub fn new_hugepage(size: usize, mount: &Path, description: &str) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::other("bank size must be non-zero"));
        }
        let path = mount.join(format!("daq-bank-{}", description));
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| io::Error::other("bank path contains NUL"))?;
        // SAFETY: c_path is a valid NUL-terminated string; flags are plain
        // open/ftruncate/mmap usage on a file we own.
        let base = unsafe {
            let fd = libc::open(c_path.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ftruncate(fd, size as libc::off_t) != 0 {
                let e = io::Error::last_os_error();
                libc::close(fd);
                libc::unlink(c_path.as_ptr());
                return Err(e);
            }
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                let e = io::Error::last_os_error();
                libc::unlink(c_path.as_ptr());
                return Err(e);
            }
            NonNull::new_unchecked(ptr.cast::<u8>())
        };
        info!(
            "created hugepage bank '{}': {} bytes mapped from {}",
            description,
            size,
            path.display()
        );
        Ok(Self {
            base,
            size,
            backing: BankBacking::HugePage { path },
            description: description.to_string(),
        })
    }

    pub fn base_address(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn backing(&self) -> &BankBacking {
        &self.backing
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Zeroes the whole region.
    pub fn clear(&self) {
        // SAFETY: base/size describe our own live mapping.
        unsafe { std::ptr::write_bytes(self.base.as_ptr(), 0, self.size) };
    }
}

impl fmt::Debug for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBank")
            .field("description", &self.description)
            .field("size", &self.size)
            .field("backing", &self.backing)
            .finish()
    }
}

impl Drop for MemoryBank {
    fn drop(&mut self) {
        debug!("releasing bank '{}'", self.description);
        match &self.backing {
            BankBacking::Malloc => {
                let layout = Layout::from_size_align(self.size, BANK_ALIGN)
                    .expect("layout was validated at allocation time");
                // SAFETY: pointer and layout match the original allocation.
                unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
            }
            BankBacking::HugePage { path } => {
                // SAFETY: unmapping our own mapping.
                unsafe {
                    libc::munmap(self.base.as_ptr().cast(), self.size);
                }
                if let Ok(c_path) = CString::new(path.as_os_str().as_encoded_bytes()) {
                    // SAFETY: plain unlink of the file we created.
                    unsafe { libc::unlink(c_path.as_ptr()) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_bank_is_usable() {
        let bank = MemoryBank::new_malloc(64 * 1024, "test").unwrap();
        assert_eq!(bank.size(), 64 * 1024);
        assert_eq!(*bank.backing(), BankBacking::Malloc);
        bank.clear();
        // SAFETY: reading inside the bank's own region.
        let first = unsafe { *bank.base_address() };
        assert_eq!(first, 0);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(MemoryBank::new_malloc(0, "empty").is_err());
    }

    #[test]
    fn hugepage_falls_back_to_error_without_mount() {
        // A regular tempdir is not hugetlbfs; mmap still works there, so
        // this only checks the file lifecycle, not hugepage semantics.
        let dir = tempfile::tempdir().unwrap();
        let bank = MemoryBank::new_hugepage(4096, dir.path(), "hp-test").unwrap();
        let BankBacking::HugePage { path } = bank.backing().clone() else {
            panic!("expected hugepage backing");
        };
        assert!(path.exists());
        drop(bank);
        assert!(!path.exists());
    }
}
