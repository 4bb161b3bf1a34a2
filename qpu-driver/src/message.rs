//! Message table handed to the firmware on every launch.
//!
//! ```text
//! row i:  +0  uniforms bus address for thread i
//!         +4  code entry bus address
//! ```

use std::mem;
use std::ptr::NonNull;

/// Words per message row.
pub const MESSAGE_COLUMNS: usize = 2;

/// Bytes per message row.
pub const MESSAGE_ROW_SIZE: usize = MESSAGE_COLUMNS * mem::size_of::<u32>();

/// Fixed `max_threads x 2` table of `(uniforms, code)` bus addresses.
pub struct MessageBuffer {
    ptr: NonNull<u32>,
    address: u32,
    rows: usize,
}

impl MessageBuffer {
    /// # Safety
    /// `ptr` must point to `rows * MESSAGE_ROW_SIZE` mapped, 4-byte aligned
    /// bytes that outlive the returned value, visible to the device at `address`.
    pub(crate) unsafe fn new(ptr: NonNull<u8>, address: u32, rows: usize) -> Self {
        Self {
            ptr: ptr.cast(),
            address,
            rows,
        }
    }

    /// Bus address of row 0, the value passed to `execute_qpu`.
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn row_address(&self, row: usize) -> Option<u32> {
        (row < self.rows).then(|| self.address + (row * MESSAGE_ROW_SIZE) as u32)
    }

    /// Current `(uniforms, code)` pair of `row`.
    pub fn row(&self, row: usize) -> Option<(u32, u32)> {
        if row >= self.rows {
            return None;
        }
        // SAFETY: row is in bounds of the table.
        unsafe {
            let p = self.ptr.as_ptr().add(row * MESSAGE_COLUMNS);
            Some((p.read_volatile(), p.add(1).read_volatile()))
        }
    }

    /// Caller has checked `row < self.rows()`.
    pub(crate) fn write_row(&self, row: usize, uniforms: u32, code: u32) {
        debug_assert!(row < self.rows);
        // SAFETY: row is in bounds; the device only reads the table during
        // `execute_qpu`, which is not running while the host writes it.
        unsafe {
            let p = self.ptr.as_ptr().add(row * MESSAGE_COLUMNS);
            p.write_volatile(uniforms);
            p.add(1).write_volatile(code);
        }
    }
}
