//! Loaded QPU programs.

use std::fmt;
use std::time::Duration;

use crate::array::{Array, Element};
use crate::driver::Driver;
use crate::error::Result;
use crate::firmware::Firmware;
use crate::phys::PhysicalMemory;

/// Something that can produce QPU machine code, such as a kernel written
/// against an assembler DSL. The driver treats the output as opaque bytes.
pub trait Assemble {
    fn assemble(&self) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Input to `Driver::load`.
pub enum ProgramSource<'a> {
    /// Already-assembled machine code.
    Bytes(&'a [u8]),
    /// A kernel description, assembled on load.
    Kernel(&'a dyn Assemble),
}

impl<'a> From<&'a [u8]> for ProgramSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        ProgramSource::Bytes(bytes)
    }
}

/// Machine code resident in the code area.
///
/// The bytes are never modified after loading, so a program can be invoked
/// any number of times while its driver is open.
pub struct Program<'d, F: Firmware, P: PhysicalMemory> {
    driver: &'d Driver<F, P>,
    address: u32,
    offset: usize,
    len: usize,
}

impl<'d, F: Firmware, P: PhysicalMemory> Program<'d, F, P> {
    pub(crate) fn new(driver: &'d Driver<F, P>, address: u32, offset: usize, len: usize) -> Self {
        Self {
            driver,
            address,
            offset,
            len,
        }
    }

    /// Bus address of the first instruction.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Byte offset of the code within the device memory region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run `num_threads` instances of this program and wait for all of them.
    ///
    /// Thread `i` receives the address of its slice of `uniforms`, which is
    /// split evenly across threads along its flat element order.
    pub fn invoke<T: Element>(
        &self,
        num_threads: usize,
        uniforms: &Array<'_, T>,
        timeout: Duration,
    ) -> Result<()> {
        self.driver.execute(self.address, num_threads, uniforms, timeout)
    }
}

impl<F: Firmware, P: PhysicalMemory> Clone for Program<'_, F, P> {
    fn clone(&self) -> Self {
        Self { ..*self }
    }
}

impl<F: Firmware, P: PhysicalMemory> fmt::Debug for Program<'_, F, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("address", &format_args!("{:#010x}", self.address))
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
