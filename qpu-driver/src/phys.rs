//! Host mappings of device memory.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr::{self, NonNull};

/// Maps a range of bus addresses into the host process.
///
/// Mappings stay valid until `unmap` is called with the same pointer and
/// length, independent of the lifetime of `self`'s other state.
pub trait PhysicalMemory {
    fn map(&self, bus_address: u32, len: usize) -> io::Result<NonNull<u8>>;

    /// Release a mapping returned by `map`.
    ///
    /// # Safety
    /// `ptr` and `len` must come from a single successful `map` call on this
    /// object, and no reference into the mapping may be used afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;
}

/// Maps physical memory through a `/dev/mem`-style character device.
#[derive(Debug, Clone)]
pub struct DevMem {
    path: PathBuf,
}

impl DevMem {
    pub fn new() -> Self {
        Self::with_path("/dev/mem")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for DevMem {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalMemory for DevMem {
    fn map(&self, bus_address: u32, len: usize) -> io::Result<NonNull<u8>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&self.path)?;

        // The mapping keeps its own reference to the device; `file` may close.
        let addr = map_shared(file.as_raw_fd(), len, u64::from(bus_address))?;

        log::debug!(
            "[devmem] Mapped {} bytes at bus {:#010x} -> {:p}",
            len,
            bus_address,
            addr
        );
        NonNull::new(addr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: caller guarantees `ptr`/`len` describe a live mapping from `map`.
        let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// `mmap` with a 64-bit file offset. Bus addresses sit above 2 GiB, which
/// does not fit a 32-bit `off_t`.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn map_shared(fd: libc::c_int, len: usize, offset: u64) -> io::Result<*mut libc::c_void> {
    let offset = libc::off64_t::try_from(offset)
        .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
    // SAFETY: a fresh shared mapping at a kernel-chosen address aliases no Rust object.
    let addr = unsafe {
        libc::mmap64(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            offset,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(addr)
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn map_shared(fd: libc::c_int, len: usize, offset: u64) -> io::Result<*mut libc::c_void> {
    let offset = libc::off_t::try_from(offset)
        .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
    // SAFETY: a fresh shared mapping at a kernel-chosen address aliases no Rust object.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            offset,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(addr)
}
