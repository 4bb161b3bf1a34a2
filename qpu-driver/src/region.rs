//! Device memory region: one firmware allocation, pinned and mapped.

use std::ptr::NonNull;

use crate::error::{DriverError, Result};
use crate::firmware::{Firmware, MEM_ALIGNMENT, MEM_FLAG_L1_NONALLOCATING};
use crate::phys::PhysicalMemory;
use crate::unwind::{Step, Unwind};

/// A block of GPU memory visible to both the host and the QPUs.
///
/// Acquired by `open` (allocate, lock, map) and released by `close` (unmap,
/// unlock, release). The region does not hold the firmware channel, so it
/// cannot release itself on drop; dropping an open region leaks the block
/// and is logged as an error.
#[must_use = "a Region must be released with close()"]
#[derive(Debug)]
pub struct Region {
    size: usize,
    handle: u32,
    bus_address: u32,
    ptr: NonNull<u8>,
    open: bool,
}

impl Region {
    /// Allocate, lock and map `size` bytes.
    ///
    /// If any step fails, the steps already completed are undone before the
    /// error is returned.
    pub fn open<F, P>(firmware: &F, memory: &P, size: usize) -> Result<Region>
    where
        F: Firmware + ?Sized,
        P: PhysicalMemory + ?Sized,
    {
        let request = u32::try_from(size).map_err(|_| DriverError::AllocationFailed { size })?;
        let mut unwind = Unwind::new(firmware);

        let handle = firmware.allocate_memory(request, MEM_ALIGNMENT, MEM_FLAG_L1_NONALLOCATING)?;
        if handle == 0 {
            return Err(DriverError::AllocationFailed { size });
        }
        unwind.push(Step::Allocated(handle));

        let bus_address = firmware.lock_memory(handle)?;
        if bus_address == 0 {
            return Err(DriverError::LockFailed { handle });
        }
        unwind.push(Step::Locked(handle));

        let ptr = memory
            .map(bus_address, size)
            .map_err(|source| DriverError::MapFailed {
                address: bus_address,
                source,
            })?;

        unwind.commit();
        log::info!(
            "[region] Opened {} bytes: handle={:#x} bus={:#010x} host={:p}",
            size,
            handle,
            bus_address,
            ptr
        );

        Ok(Region {
            size,
            handle,
            bus_address,
            ptr,
            open: true,
        })
    }

    /// Unmap, unlock and release, in that order.
    ///
    /// All three steps are attempted; the first failure is returned.
    pub fn close<F, P>(mut self, firmware: &F, memory: &P) -> Result<()>
    where
        F: Firmware + ?Sized,
        P: PhysicalMemory + ?Sized,
    {
        self.release(firmware, memory)
    }

    /// Teardown for owners that cannot give the region up by value.
    /// Does nothing once the region is closed.
    pub(crate) fn release<F, P>(&mut self, firmware: &F, memory: &P) -> Result<()>
    where
        F: Firmware + ?Sized,
        P: PhysicalMemory + ?Sized,
    {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        // SAFETY: the region is closed, so every view derived from it is dead:
        // arrays and programs borrow the owning driver, which is being torn down.
        let unmapped = unsafe { memory.unmap(self.ptr, self.size) }.map_err(DriverError::from);
        let unlocked = firmware.unlock_memory(self.handle).map_err(DriverError::from);
        let released = firmware.release_memory(self.handle).map_err(DriverError::from);

        log::info!("[region] Closed handle {:#x}", self.handle);
        unmapped.and(unlocked).and(released)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Bus address of byte 0, as returned by the lock request.
    pub fn bus_address(&self) -> u32 {
        self.bus_address
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Copy `data` into the mapping at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Option<()> {
        let end = offset.checked_add(data.len())?;
        if end > self.size {
            return None;
        }
        // SAFETY: bounds checked; `data` cannot alias device memory mutably.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Some(())
    }

    /// Copy `len` bytes out of the mapping at `offset`.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        if end > self.size {
            return None;
        }
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Some(out)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.open {
            log::error!(
                "[region] Handle {:#x} dropped without close(); {} bytes of device memory leaked",
                self.handle,
                self.size
            );
        }
    }
}
