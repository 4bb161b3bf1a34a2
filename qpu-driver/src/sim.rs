//! In-process stand-in for the VideoCore firmware and physical memory.
//!
//! `SimulatedBoard` implements both `Firmware` and `PhysicalMemory`, so a
//! `Driver` can run without a Raspberry Pi. GPU memory blocks are ordinary
//! host allocations with a fake bus address; "executing" a kernel runs a
//! host closure once per thread against that memory.
//!
//! Every request is recorded in order, and each acquisition step can be made
//! to fail once, which is how rollback is tested.
//!
//! The board is single-threaded (`Rc<RefCell<..>>`); clone it to hand one
//! copy to the driver as firmware and another as physical memory.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::FirmwareError;
use crate::firmware::Firmware;
use crate::message::{MESSAGE_COLUMNS, MESSAGE_ROW_SIZE};
use crate::phys::PhysicalMemory;

/// First bus address handed out (the uncached 0xC alias).
pub const SIM_BUS_BASE: u32 = 0xC000_0000;

/// Default amount of simulated GPU memory.
pub const SIM_DEFAULT_CAPACITY: usize = 256 * 1024 * 1024;

const SIM_BLOCK_ALIGN: usize = 4096;

/// A request seen by the board, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareCall {
    Allocate { size: u32, align: u32, flags: u32 },
    Lock(u32),
    Unlock(u32),
    Release(u32),
    EnableQpu(bool),
    Execute { num_qpus: u32, control: u32, noflush: u32, timeout_ms: u32 },
    Map { address: u32, len: usize },
    Unmap { len: usize },
}

/// Acquisition step that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// `enable_qpu(true)` returns an error.
    Enable,
    /// `allocate_memory` returns handle 0.
    Allocate,
    /// `lock_memory` returns address 0.
    Lock,
    /// `map` returns an I/O error.
    Map,
}

/// Per-thread launch parameters read from the message table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    pub thread: u32,
    pub uniforms: u32,
    pub code: u32,
}

/// Host-side kernel run once per launched thread.
pub type Kernel = dyn Fn(&ThreadContext, &SimMemory<'_>);

struct Block {
    ptr: NonNull<u8>,
    size: usize,
    bus_address: u32,
    locked: bool,
}

impl Block {
    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.max(1), SIM_BLOCK_ALIGN).ok()
    }

    fn contains(&self, address: u32, len: usize) -> bool {
        let start = self.bus_address as usize;
        let address = address as usize;
        address >= start && address + len <= start + self.size
    }
}

/// Bus-address view of the board's locked memory, given to kernels.
pub struct SimMemory<'a> {
    blocks: &'a BTreeMap<u32, Block>,
}

impl SimMemory<'_> {
    fn translate(&self, address: u32, len: usize) -> Option<*mut u8> {
        self.blocks
            .values()
            .find(|b| b.locked && b.contains(address, len))
            .map(|b| unsafe { b.ptr.as_ptr().add((address - b.bus_address) as usize) })
    }

    pub fn read_u32(&self, address: u32) -> Option<u32> {
        let ptr = self.translate(address, 4)?;
        // SAFETY: `translate` checked the 4 bytes lie inside a live block.
        Some(unsafe { (ptr as *const u32).read_unaligned() })
    }

    pub fn write_u32(&self, address: u32, value: u32) -> Option<()> {
        let ptr = self.translate(address, 4)?;
        // SAFETY: as above; blocks are only reachable through raw pointers.
        unsafe { (ptr as *mut u32).write_unaligned(value) };
        Some(())
    }
}

struct SimState {
    capacity: usize,
    in_use: usize,
    next_handle: u32,
    next_bus: u64,
    blocks: BTreeMap<u32, Block>,
    enabled: bool,
    mappings: usize,
    calls: Vec<FirmwareCall>,
    fail: Option<FailPoint>,
    execute_status: i32,
    kernel: Option<Rc<Kernel>>,
}

impl SimState {
    fn take_fail(&mut self, point: FailPoint) -> bool {
        if self.fail == Some(point) {
            self.fail = None;
            log::debug!("[sim] Injected failure at {:?}", point);
            true
        } else {
            false
        }
    }
}

impl Drop for SimState {
    fn drop(&mut self) {
        for (_, block) in std::mem::take(&mut self.blocks) {
            if let Some(layout) = Block::layout(block.size) {
                // SAFETY: allocated in `allocate_memory` with this layout.
                unsafe { alloc::dealloc(block.ptr.as_ptr(), layout) };
            }
        }
    }
}

/// Simulated firmware plus bus-addressed memory.
#[derive(Clone)]
pub struct SimulatedBoard {
    state: Rc<RefCell<SimState>>,
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self::with_capacity(SIM_DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                capacity,
                in_use: 0,
                next_handle: 1,
                next_bus: SIM_BUS_BASE as u64,
                blocks: BTreeMap::new(),
                enabled: false,
                mappings: 0,
                calls: Vec::new(),
                fail: None,
                execute_status: 0,
                kernel: None,
            })),
        }
    }

    /// Install the kernel run by `execute_qpu`.
    ///
    /// The kernel must not call back into the board.
    pub fn with_kernel(self, kernel: impl Fn(&ThreadContext, &SimMemory<'_>) + 'static) -> Self {
        self.state.borrow_mut().kernel = Some(Rc::new(kernel));
        self
    }

    /// Make the next request at `point` fail.
    pub fn fail_at(&self, point: FailPoint) {
        self.state.borrow_mut().fail = Some(point);
    }

    /// Status returned by subsequent launches; positive means timeout.
    /// Threads still run for a zero or negative status.
    pub fn set_execute_status(&self, status: i32) {
        self.state.borrow_mut().execute_status = status;
    }

    pub fn calls(&self) -> Vec<FirmwareCall> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Number of allocations not yet released.
    pub fn live_allocations(&self) -> usize {
        self.state.borrow().blocks.len()
    }

    pub fn locked_count(&self) -> usize {
        self.state.borrow().blocks.values().filter(|b| b.locked).count()
    }

    pub fn mapped_count(&self) -> usize {
        self.state.borrow().mappings
    }

    pub fn is_enabled(&self) -> bool {
        self.state.borrow().enabled
    }

    /// Read a word of locked memory by bus address.
    pub fn read_u32(&self, address: u32) -> Option<u32> {
        let state = self.state.borrow();
        SimMemory { blocks: &state.blocks }.read_u32(address)
    }

    fn record(&self, call: FirmwareCall) {
        log::trace!("[sim] {:?}", call);
        self.state.borrow_mut().calls.push(call);
    }
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Firmware for SimulatedBoard {
    fn allocate_memory(&self, size: u32, align: u32, flags: u32) -> Result<u32, FirmwareError> {
        self.record(FirmwareCall::Allocate { size, align, flags });
        let mut state = self.state.borrow_mut();
        if state.take_fail(FailPoint::Allocate) {
            return Ok(0);
        }

        let size = size as usize;
        let align = (align as u64).max(1);
        let bus = state.next_bus.div_ceil(align) * align;
        let layout = match Block::layout(size) {
            Some(layout) => layout,
            None => return Ok(0),
        };
        if state.in_use + size > state.capacity || bus + size as u64 > u32::MAX as u64 + 1 {
            log::warn!("[sim] Out of GPU memory ({} bytes requested)", size);
            return Ok(0);
        }

        // SAFETY: layout has non-zero size.
        let ptr = match NonNull::new(unsafe { alloc::alloc_zeroed(layout) }) {
            Some(ptr) => ptr,
            None => return Ok(0),
        };

        let handle = state.next_handle;
        state.next_handle += 1;
        state.next_bus = bus + size as u64;
        state.in_use += size;
        state.blocks.insert(
            handle,
            Block {
                ptr,
                size,
                bus_address: bus as u32,
                locked: false,
            },
        );
        Ok(handle)
    }

    fn lock_memory(&self, handle: u32) -> Result<u32, FirmwareError> {
        self.record(FirmwareCall::Lock(handle));
        let mut state = self.state.borrow_mut();
        if state.take_fail(FailPoint::Lock) {
            return Ok(0);
        }
        match state.blocks.get_mut(&handle) {
            Some(block) => {
                block.locked = true;
                Ok(block.bus_address)
            }
            None => Ok(0),
        }
    }

    fn unlock_memory(&self, handle: u32) -> Result<(), FirmwareError> {
        self.record(FirmwareCall::Unlock(handle));
        let mut state = self.state.borrow_mut();
        match state.blocks.get_mut(&handle) {
            Some(block) if block.locked => {
                block.locked = false;
                Ok(())
            }
            _ => Err(FirmwareError::Rejected {
                op: "unlock_memory",
                status: handle,
            }),
        }
    }

    fn release_memory(&self, handle: u32) -> Result<(), FirmwareError> {
        self.record(FirmwareCall::Release(handle));
        let mut state = self.state.borrow_mut();
        let locked = match state.blocks.get(&handle) {
            Some(block) => block.locked,
            None => {
                return Err(FirmwareError::Rejected {
                    op: "release_memory",
                    status: handle,
                });
            }
        };
        if locked {
            return Err(FirmwareError::Rejected {
                op: "release_memory",
                status: handle,
            });
        }

        if let Some(block) = state.blocks.remove(&handle) {
            state.in_use -= block.size;
            if let Some(layout) = Block::layout(block.size) {
                // SAFETY: allocated in `allocate_memory` with this layout.
                unsafe { alloc::dealloc(block.ptr.as_ptr(), layout) };
            }
        }
        Ok(())
    }

    fn enable_qpu(&self, enable: bool) -> Result<(), FirmwareError> {
        self.record(FirmwareCall::EnableQpu(enable));
        let mut state = self.state.borrow_mut();
        if enable && state.take_fail(FailPoint::Enable) {
            return Err(FirmwareError::Rejected {
                op: "enable_qpu",
                status: 0x8000_0001,
            });
        }
        state.enabled = enable;
        Ok(())
    }

    fn execute_qpu(
        &self,
        num_qpus: u32,
        control: u32,
        noflush: u32,
        timeout_ms: u32,
    ) -> Result<i32, FirmwareError> {
        self.record(FirmwareCall::Execute {
            num_qpus,
            control,
            noflush,
            timeout_ms,
        });
        let state = self.state.borrow();
        if !state.enabled {
            return Err(FirmwareError::Rejected {
                op: "execute_qpu",
                status: 0x8000_0001,
            });
        }
        let status = state.execute_status;
        if status > 0 {
            return Ok(status);
        }

        let memory = SimMemory {
            blocks: &state.blocks,
        };
        let kernel = state.kernel.clone();
        for thread in 0..num_qpus {
            let row = control + thread * MESSAGE_ROW_SIZE as u32;
            let (uniforms, code) = match (
                memory.read_u32(row),
                memory.read_u32(row + (MESSAGE_ROW_SIZE / MESSAGE_COLUMNS) as u32),
            ) {
                (Some(u), Some(c)) => (u, c),
                _ => {
                    return Err(FirmwareError::Rejected {
                        op: "execute_qpu",
                        status: control,
                    });
                }
            };
            if let Some(kernel) = &kernel {
                kernel(&ThreadContext { thread, uniforms, code }, &memory);
            }
        }
        Ok(status)
    }
}

impl PhysicalMemory for SimulatedBoard {
    fn map(&self, bus_address: u32, len: usize) -> io::Result<NonNull<u8>> {
        self.record(FirmwareCall::Map {
            address: bus_address,
            len,
        });
        let mut state = self.state.borrow_mut();
        if state.take_fail(FailPoint::Map) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        let ptr = state
            .blocks
            .values()
            .find(|b| b.locked && b.bus_address == bus_address && len <= b.size)
            .map(|b| b.ptr)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        state.mappings += 1;
        Ok(ptr)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        self.record(FirmwareCall::Unmap { len });
        let mut state = self.state.borrow_mut();
        if state.mappings == 0 || !state.blocks.values().any(|b| b.ptr == ptr) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        state.mappings -= 1;
        Ok(())
    }
}

/// Number of SIMD lanes per QPU.
pub const SIMD_WIDTH: u32 = 16;

/// Host model of the hello-world kernel.
///
/// Each thread reads two uniforms, a base value and an output address, and
/// stores `base + element_number` for all 16 lanes at the output address.
pub fn add_element_number(ctx: &ThreadContext, memory: &SimMemory<'_>) {
    let base = memory.read_u32(ctx.uniforms);
    let out = memory.read_u32(ctx.uniforms + 4);
    let (Some(base), Some(out)) = (base, out) else {
        log::warn!("[sim] Thread {} has unreadable uniforms at {:#010x}", ctx.thread, ctx.uniforms);
        return;
    };
    for lane in 0..SIMD_WIDTH {
        if memory.write_u32(out + lane * 4, base.wrapping_add(lane)).is_none() {
            log::warn!("[sim] Thread {} store outside device memory at {:#010x}", ctx.thread, out);
            return;
        }
    }
}
