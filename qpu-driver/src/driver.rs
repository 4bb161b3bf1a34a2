//! Top-level QPU driver.
//!
//! A `Driver` powers the QPUs, owns one device memory region split into
//! code, data and message areas, and launches programs. Arrays and programs
//! borrow the driver, so they cannot outlive its memory.
//!
//! The driver is `!Sync`: all launches go through one message table, and the
//! type system keeps two threads from writing it at once. `invoke` blocks
//! until the firmware reports completion or timeout, so there is never more
//! than one launch in flight per driver.

use std::cell::Cell;
use std::mem;
use std::ptr::NonNull;
use std::time::Duration;

use crate::array::{element_count, Array, Element};
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::firmware::Firmware;
use crate::layout::MemoryLayout;
use crate::message::MessageBuffer;
use crate::phys::{DevMem, PhysicalMemory};
use crate::program::{Assemble, Program, ProgramSource};
use crate::region::Region;
use crate::unwind::{Step, Unwind};

/// Value of the `noflush` argument for every launch.
const EXECUTE_NOFLUSH: u32 = 1;

pub struct Driver<F: Firmware, P: PhysicalMemory = DevMem> {
    firmware: F,
    memory: P,
    config: DriverConfig,
    layout: MemoryLayout,
    region: Region,
    message: MessageBuffer,
    needs_reset: Cell<bool>,
}

impl<F: Firmware> Driver<F, DevMem> {
    /// Open a driver that maps device memory through `/dev/mem`.
    pub fn new(firmware: F, config: DriverConfig) -> Result<Self> {
        Self::open(firmware, DevMem::new(), config)
    }
}

impl<F: Firmware, P: PhysicalMemory> Driver<F, P> {
    /// Enable the QPUs and acquire device memory sized by `config`.
    ///
    /// On failure everything acquired so far is released and the QPUs are
    /// disabled again before the error is returned.
    pub fn open(firmware: F, memory: P, config: DriverConfig) -> Result<Self> {
        config.validate()?;
        let layout = config
            .layout()
            .ok_or_else(|| DriverError::InvalidConfig("area sizes overflow".into()))?;

        firmware.enable_qpu(true)?;
        let region = {
            let mut unwind = Unwind::new(&firmware);
            unwind.push(Step::QpuEnabled);
            let region = Region::open(&firmware, &memory, layout.total_size())?;
            unwind.commit();
            region
        };

        // SAFETY: message_base + max_threads rows == total_size, inside the
        // mapping; code and data sizes are multiples of 4 so the table is
        // word-aligned on the page-aligned mapping.
        let message = unsafe {
            let ptr = NonNull::new_unchecked(region.as_ptr().add(layout.message_base()));
            let address = region.bus_address() + layout.message_base() as u32;
            MessageBuffer::new(ptr, address, config.max_threads)
        };

        log::info!(
            "[qpu] Driver open: code={} data={} max_threads={} base={:#010x}",
            config.code_area_size,
            config.data_area_size,
            config.max_threads,
            region.bus_address()
        );

        Ok(Self {
            firmware,
            memory,
            config,
            layout,
            region,
            message,
            needs_reset: Cell::new(false),
        })
    }

    /// Open a driver, run `f` with it, and close it whether or not `f`
    /// succeeded. An error from `f` takes precedence over a close error.
    pub fn scoped<R>(
        firmware: F,
        memory: P,
        config: DriverConfig,
        f: impl FnOnce(&Driver<F, P>) -> Result<R>,
    ) -> Result<R> {
        let driver = Self::open(firmware, memory, config)?;
        let result = f(&driver);
        let closed = driver.close();
        match result {
            Ok(value) => closed.map(|()| value),
            Err(e) => {
                if let Err(close_err) = closed {
                    log::error!("[qpu] Close after failure also failed: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Release device memory, then disable the QPUs.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if !self.region.is_open() {
            return Ok(());
        }
        let released = self.region.release(&self.firmware, &self.memory);
        let disabled = self.firmware.enable_qpu(false).map_err(DriverError::from);
        log::info!("[qpu] Driver closed");
        released.and(disabled)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn message(&self) -> &MessageBuffer {
        &self.message
    }

    pub fn firmware(&self) -> &F {
        &self.firmware
    }

    /// Bus address of the start of device memory.
    pub fn base_address(&self) -> u32 {
        self.region.bus_address()
    }

    pub fn max_threads(&self) -> usize {
        self.config.max_threads
    }

    /// True after a launch timed out and before `reset`.
    pub fn needs_reset(&self) -> bool {
        self.needs_reset.get()
    }

    /// Carve an array of `shape` from the data area.
    ///
    /// The contents are not initialised. Space is only reclaimed when the
    /// driver closes.
    pub fn array<T: Element>(&self, shape: &[usize]) -> Result<Array<'_, T>> {
        let nbytes = element_count(shape)
            .and_then(|n| n.checked_mul(mem::size_of::<T>()))
            .ok_or(DriverError::ArrayTooLarge {
                requested: usize::MAX,
                available: self.layout.message_base() - self.layout.data_pos(),
            })?;
        let offset = self.layout.reserve_data(nbytes, mem::align_of::<T>())?;
        let address = self.region.bus_address() + offset as u32;

        log::debug!(
            "[qpu] Array {}{:?}: {} bytes at offset {:#x} (bus {:#010x})",
            T::NAME,
            shape,
            nbytes,
            offset,
            address
        );

        // SAFETY: `reserve_data` returned an aligned range inside the data
        // area that no other array or program overlaps, and the mapping lives
        // as long as `&self`.
        unsafe {
            let ptr = NonNull::new_unchecked(self.region.as_ptr().add(offset));
            Ok(Array::new(ptr, offset, address, shape))
        }
    }

    /// Copy assembled machine code into the code area.
    pub fn program(&self, code: &[u8]) -> Result<Program<'_, F, P>> {
        let offset = self.layout.reserve_code(code.len())?;
        self.region
            .write_bytes(offset, code)
            .ok_or(DriverError::ProgramTooLong {
                requested: code.len(),
                available: 0,
            })?;
        let address = self.region.bus_address() + offset as u32;

        log::debug!(
            "[qpu] Program: {} bytes at {:#010x} [{}{}]",
            code.len(),
            address,
            hex::encode(&code[..code.len().min(16)]),
            if code.len() > 16 { "..." } else { "" }
        );
        Ok(Program::new(self, address, offset, code.len()))
    }

    /// Assemble `kernel` and load the result.
    pub fn program_kernel(&self, kernel: &dyn Assemble) -> Result<Program<'_, F, P>> {
        let code = kernel
            .assemble()
            .map_err(|e| DriverError::Assembly(e.to_string()))?;
        self.program(&code)
    }

    pub fn load(&self, source: ProgramSource<'_>) -> Result<Program<'_, F, P>> {
        match source {
            ProgramSource::Bytes(code) => self.program(code),
            ProgramSource::Kernel(kernel) => self.program_kernel(kernel),
        }
    }

    /// Fill the message table and launch `num_threads` threads at `code`.
    pub(crate) fn execute<T: Element>(
        &self,
        code: u32,
        num_threads: usize,
        uniforms: &Array<'_, T>,
        timeout: Duration,
    ) -> Result<()> {
        if self.needs_reset.get() {
            return Err(DriverError::ResetRequired);
        }
        let max = self.config.max_threads;
        if num_threads == 0 || num_threads > max {
            return Err(DriverError::InvalidThreadCount {
                count: num_threads,
                max,
            });
        }
        if uniforms.is_empty() || uniforms.len() % num_threads != 0 {
            return Err(DriverError::UniformShape {
                elements: uniforms.len(),
                threads: num_threads,
            });
        }

        let stride = (uniforms.len() / num_threads) * uniforms.itemsize();
        for thread in 0..num_threads {
            let uniform_address = uniforms.address() + (thread * stride) as u32;
            self.message.write_row(thread, uniform_address, code);
        }

        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        log::debug!(
            "[qpu] Launch {} threads at {:#010x}, message {:#010x}, timeout {} ms",
            num_threads,
            code,
            self.message.address(),
            timeout_ms
        );

        let status = self.firmware.execute_qpu(
            num_threads as u32,
            self.message.address(),
            EXECUTE_NOFLUSH,
            timeout_ms,
        )?;
        if status > 0 {
            log::warn!("[qpu] Execution timed out (status {}); reset required", status);
            self.needs_reset.set(true);
            return Err(DriverError::ExecutionTimeout { timeout_ms });
        }
        Ok(())
    }

    /// Power-cycle the QPUs after a timeout so launches can resume.
    pub fn reset(&self) -> Result<()> {
        self.firmware.enable_qpu(false)?;
        self.firmware.enable_qpu(true)?;
        self.needs_reset.set(false);
        log::info!("[qpu] QPUs reset");
        Ok(())
    }
}

impl<F: Firmware, P: PhysicalMemory> Drop for Driver<F, P> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("[qpu] Teardown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FailPoint, FirmwareCall, SimulatedBoard};

    fn small_config() -> DriverConfig {
        DriverConfig {
            data_area_size: 4096,
            code_area_size: 256,
            max_threads: 16,
        }
    }

    fn open(board: &SimulatedBoard) -> Driver<SimulatedBoard, SimulatedBoard> {
        Driver::open(board.clone(), board.clone(), small_config()).unwrap()
    }

    #[test]
    fn test_construction_sequence() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        assert!(board.is_enabled());
        assert_eq!(driver.region().size(), 256 + 4096 + 16 * 8);
        assert_eq!(driver.message().rows(), 16);
        assert_eq!(driver.message().address(), driver.base_address() + 256 + 4096);

        driver.close().unwrap();
        assert!(!board.is_enabled());
        assert_eq!(board.live_allocations(), 0);
        assert_eq!(board.mapped_count(), 0);
        assert_eq!(board.calls().last(), Some(&FirmwareCall::EnableQpu(false)));
    }

    #[test]
    fn test_drop_tears_down() {
        let board = SimulatedBoard::new();
        {
            let _driver = open(&board);
        }
        assert!(!board.is_enabled());
        assert_eq!(board.live_allocations(), 0);
    }

    #[test]
    fn test_enable_failure_acquires_nothing() {
        let board = SimulatedBoard::new();
        board.fail_at(FailPoint::Enable);
        let err = Driver::open(board.clone(), board.clone(), small_config()).err().unwrap();
        assert!(matches!(err, DriverError::Firmware(_)));
        assert_eq!(board.calls(), vec![FirmwareCall::EnableQpu(true)]);
    }

    #[test]
    fn test_region_failure_disables_qpu() {
        for point in [FailPoint::Allocate, FailPoint::Lock, FailPoint::Map] {
            let board = SimulatedBoard::new();
            board.fail_at(point);
            assert!(Driver::open(board.clone(), board.clone(), small_config()).is_err());
            assert!(!board.is_enabled(), "{:?}", point);
            assert_eq!(board.live_allocations(), 0, "{:?}", point);
            assert_eq!(board.locked_count(), 0, "{:?}", point);
            assert_eq!(board.calls().last(), Some(&FirmwareCall::EnableQpu(false)));
        }
    }

    #[test]
    fn test_invalid_config_touches_no_firmware() {
        let board = SimulatedBoard::new();
        let config = DriverConfig {
            max_threads: 0,
            ..small_config()
        };
        assert!(Driver::open(board.clone(), board.clone(), config).is_err());
        assert!(board.calls().is_empty());
    }

    #[test]
    fn test_arrays_are_disjoint_and_addressed() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        let base = driver.base_address();

        let a = driver.array::<u8>(&[3]).unwrap();
        let b = driver.array::<u32>(&[4, 2]).unwrap();
        let c = driver.array::<f32>(&[5]).unwrap();

        assert_eq!(a.offset(), 256);
        assert_eq!(b.offset(), 260);
        assert_eq!(c.offset(), 260 + 32);
        let placed = [
            (a.offset(), a.address()),
            (b.offset(), b.address()),
            (c.offset(), c.address()),
        ];
        for (offset, address) in placed {
            assert_eq!(address, base + offset as u32);
        }
        assert_eq!(driver.layout().data_pos(), 260 + 32 + 20);
    }

    #[test]
    fn test_empty_carves_keep_offsets_increasing() {
        let board = SimulatedBoard::new();
        let driver = open(&board);

        let empty = driver.array::<u32>(&[0, 2]).unwrap();
        let next = driver.array::<u32>(&[2]).unwrap();
        assert!(empty.is_empty());
        assert!(empty.offset() < next.offset());
        assert_eq!(next.offset(), 260);

        let nothing = driver.program(&[]).unwrap();
        let code = driver.program(&[0; 8]).unwrap();
        assert!(nothing.is_empty());
        assert!(nothing.offset() < code.offset());
    }

    #[test]
    fn test_array_too_large_leaves_cursor() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        let _a = driver.array::<u32>(&[1000]).unwrap();
        let before = driver.layout().data_pos();

        let err = driver.array::<u32>(&[25]).unwrap_err();
        assert!(matches!(err, DriverError::ArrayTooLarge { requested: 100, available: 96 }));
        assert_eq!(driver.layout().data_pos(), before);

        let err = driver.array::<u32>(&[usize::MAX, 4]).unwrap_err();
        assert!(matches!(err, DriverError::ArrayTooLarge { .. }));
        assert!(driver.array::<u32>(&[24]).is_ok());
    }

    #[test]
    fn test_host_writes_reach_device_memory() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        let mut arr = driver.array::<u32>(&[2, 2]).unwrap();
        arr.as_mut_slice().copy_from_slice(&[10, 11, 12, 13]);

        for flat in 0..4 {
            let addr = arr.address_of(flat).unwrap();
            assert_eq!(board.read_u32(addr), Some(10 + flat as u32));
            assert_eq!(arr.address_of(flat), Some(addr));
        }
    }

    #[test]
    fn test_program_copies_bytes_and_advances() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        let code = [0x00, 0x70, 0x9e, 0x00, 0xe7, 0x09, 0x00, 0x30];

        let first = driver.program(&code).unwrap();
        let second = driver.program(&code).unwrap();
        assert_eq!(first.address(), driver.base_address());
        assert_eq!(second.address(), driver.base_address() + 8);
        assert_eq!(driver.region().read_bytes(8, 8).unwrap(), code.to_vec());
        assert_eq!(driver.layout().code_pos(), 16);
    }

    #[test]
    fn test_program_too_long_writes_nothing() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        driver.program(&[0xAA; 200]).unwrap();

        let err = driver.program(&[0xBB; 64]).unwrap_err();
        assert!(matches!(err, DriverError::ProgramTooLong { requested: 64, available: 56 }));
        assert_eq!(driver.layout().code_pos(), 200);
        assert_eq!(driver.region().read_bytes(200, 56).unwrap(), vec![0u8; 56]);
    }

    type AssembleResult = std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;

    struct FixedKernel(Vec<u8>);

    impl Assemble for FixedKernel {
        fn assemble(&self) -> AssembleResult {
            Ok(self.0.clone())
        }
    }

    struct BrokenKernel;

    impl Assemble for BrokenKernel {
        fn assemble(&self) -> AssembleResult {
            Err("undefined label `loop`".into())
        }
    }

    #[test]
    fn test_load_kernel_or_bytes() {
        let board = SimulatedBoard::new();
        let driver = open(&board);

        let kernel = FixedKernel(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let from_kernel = driver.load(ProgramSource::Kernel(&kernel)).unwrap();
        let from_bytes = driver.load(ProgramSource::from(&[9u8; 8][..])).unwrap();
        assert_eq!(from_kernel.len(), 8);
        assert_eq!(from_bytes.offset(), 8);

        let err = driver.program_kernel(&BrokenKernel).unwrap_err();
        assert!(matches!(err, DriverError::Assembly(msg) if msg.contains("loop")));
        assert_eq!(driver.layout().code_pos(), 16);
    }

    #[test]
    fn test_thread_count_bounds() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        let prog = driver.program(&[0; 8]).unwrap();
        let uniforms = driver.array::<u32>(&[17, 2]).unwrap();
        let timeout = Duration::from_millis(100);

        for bad in [0, 17] {
            let err = prog.invoke(bad, &uniforms, timeout).unwrap_err();
            assert!(matches!(err, DriverError::InvalidThreadCount { max: 16, .. }));
        }
        let small = driver.array::<u32>(&[16, 2]).unwrap();
        prog.invoke(16, &small, timeout).unwrap();
        let single = driver.array::<u32>(&[1, 2]).unwrap();
        prog.invoke(1, &single, timeout).unwrap();
    }

    #[test]
    fn test_invalid_thread_count_writes_no_rows() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        let prog = driver.program(&[0; 8]).unwrap();
        let uniforms = driver.array::<u32>(&[16, 2]).unwrap();
        let before: Vec<_> = (0..16).map(|r| driver.message().row(r)).collect();
        board.clear_calls();

        assert!(prog.invoke(0, &uniforms, Duration::from_millis(1)).is_err());
        let after: Vec<_> = (0..16).map(|r| driver.message().row(r)).collect();
        assert_eq!(before, after);
        assert!(board.calls().is_empty());
    }

    #[test]
    fn test_message_rows_and_isolation() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        let prog_a = driver.program(&[0; 8]).unwrap();
        let prog_b = driver.program(&[0; 8]).unwrap();
        let uniforms = driver.array::<u32>(&[16, 2]).unwrap();
        let timeout = Duration::from_millis(50);

        prog_a.invoke(16, &uniforms, timeout).unwrap();

        let few = driver.array::<u32>(&[4, 2]).unwrap();
        prog_b.invoke(4, &few, timeout).unwrap();
        for row in 0..4 {
            let expected = (few.row_address(row).unwrap(), prog_b.address());
            assert_eq!(driver.message().row(row), Some(expected));
        }
        for row in 4..16 {
            let expected = (uniforms.row_address(row).unwrap(), prog_a.address());
            assert_eq!(driver.message().row(row), Some(expected));
        }
        assert_eq!(
            board.calls().last(),
            Some(&FirmwareCall::Execute {
                num_qpus: 4,
                control: driver.message().address(),
                noflush: 1,
                timeout_ms: 50
            })
        );
    }

    #[test]
    fn test_uniform_shape_must_split_across_threads() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        let prog = driver.program(&[0; 8]).unwrap();
        let uniforms = driver.array::<u32>(&[5]).unwrap();

        let err = prog.invoke(2, &uniforms, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, DriverError::UniformShape { elements: 5, threads: 2 }));
        let empty = driver.array::<u32>(&[0, 2]).unwrap();
        assert!(prog.invoke(1, &empty, Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_timeout_requires_reset() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        let prog = driver.program(&[0; 8]).unwrap();
        let uniforms = driver.array::<u32>(&[2, 2]).unwrap();

        board.set_execute_status(1);
        let err = prog.invoke(2, &uniforms, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DriverError::ExecutionTimeout { timeout_ms: 20 }));
        assert!(driver.needs_reset());

        board.set_execute_status(0);
        let err = prog.invoke(2, &uniforms, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DriverError::ResetRequired));

        driver.reset().unwrap();
        assert!(!driver.needs_reset());
        prog.invoke(2, &uniforms, Duration::from_millis(20)).unwrap();
    }

    #[test]
    fn test_negative_status_is_completion() {
        let board = SimulatedBoard::new();
        let driver = open(&board);
        let prog = driver.program(&[0; 8]).unwrap();
        let uniforms = driver.array::<u32>(&[4, 2]).unwrap();

        for status in [-1, i32::MIN] {
            board.set_execute_status(status);
            prog.invoke(4, &uniforms, Duration::from_millis(10)).unwrap();
            assert!(!driver.needs_reset());
        }
    }

    #[test]
    fn test_scoped_closes_on_error() {
        let board = SimulatedBoard::new();
        let result: Result<()> =
            Driver::scoped(board.clone(), board.clone(), small_config(), |drv| {
                drv.array::<u32>(&[100_000])?;
                Ok(())
            });
        assert!(matches!(result, Err(DriverError::ArrayTooLarge { .. })));
        assert!(!board.is_enabled());
        assert_eq!(board.live_allocations(), 0);
    }

    #[test]
    fn test_scoped_returns_value() {
        let board = SimulatedBoard::new();
        let base = Driver::scoped(board.clone(), board.clone(), small_config(), |drv| {
            Ok(drv.base_address())
        })
        .unwrap();
        assert_ne!(base, 0);
        assert_eq!(board.live_allocations(), 0);
    }
}
