//! Firmware channel capability set.
//!
//! The VideoCore firmware owns GPU memory and the QPU scheduler. The driver
//! only needs six requests from it: four to manage a block of GPU memory, one
//! to power the QPUs and one to launch a kernel. How those requests travel to
//! the firmware (property mailbox, ioctl, simulation) is up to the
//! implementation.

use crate::error::FirmwareError;

// ============================================================================
// Memory allocation flags (passed to `allocate_memory`)
// ============================================================================

/// Block can be resized to zero at any time.
pub const MEM_FLAG_DISCARDABLE: u32 = 1 << 0;
/// Normal allocating alias. Don't use from ARM.
pub const MEM_FLAG_NORMAL: u32 = 0 << 2;
/// 0xC alias, uncached.
pub const MEM_FLAG_DIRECT: u32 = 1 << 2;
/// 0x8 alias, non-allocating in L2 but coherent.
pub const MEM_FLAG_COHERENT: u32 = 2 << 2;
/// Allocating in L2 but not in L1.
pub const MEM_FLAG_L1_NONALLOCATING: u32 = MEM_FLAG_DIRECT | MEM_FLAG_COHERENT;
/// Initialise buffer to all zeros.
pub const MEM_FLAG_ZERO: u32 = 1 << 4;
/// Don't initialise (default is initialise to all ones).
pub const MEM_FLAG_NO_INIT: u32 = 1 << 5;
/// Likely to be locked for long periods of time.
pub const MEM_FLAG_HINT_PERMALOCK: u32 = 1 << 6;

/// Alignment requested for every device memory allocation.
pub const MEM_ALIGNMENT: u32 = 4096;

/// Requests the driver issues to the VideoCore firmware.
///
/// Methods take `&self`; implementations that keep state use interior
/// mutability. A `Driver` holds its channel exclusively for its lifetime.
pub trait Firmware {
    /// Allocate `size` bytes of GPU memory. Returns an opaque handle, or 0
    /// when the firmware has no memory to give.
    fn allocate_memory(&self, size: u32, align: u32, flags: u32) -> Result<u32, FirmwareError>;

    /// Pin an allocation and return its bus address, or 0 on failure.
    fn lock_memory(&self, handle: u32) -> Result<u32, FirmwareError>;

    fn unlock_memory(&self, handle: u32) -> Result<(), FirmwareError>;

    fn release_memory(&self, handle: u32) -> Result<(), FirmwareError>;

    /// Power the QPUs on (`true`) or off (`false`).
    fn enable_qpu(&self, enable: bool) -> Result<(), FirmwareError>;

    /// Launch `num_qpus` threads described by the message table at bus
    /// address `control` and block until they finish or `timeout_ms` elapses.
    ///
    /// A positive return value means the launch timed out; zero or a
    /// negative value means it completed.
    fn execute_qpu(
        &self,
        num_qpus: u32,
        control: u32,
        noflush: u32,
        timeout_ms: u32,
    ) -> Result<i32, FirmwareError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l1_nonallocating_flag() {
        assert_eq!(MEM_FLAG_L1_NONALLOCATING, 0xC);
        assert_eq!(MEM_FLAG_NORMAL, 0);
    }
}
