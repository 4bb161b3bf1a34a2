use std::time::Duration;

use qpu_driver::sim::{self, FailPoint, FirmwareCall, SimulatedBoard};
use qpu_driver::{Driver, DriverConfig, DriverError};

const NUM_THREADS: usize = 16;

fn config() -> DriverConfig {
    DriverConfig {
        max_threads: NUM_THREADS,
        ..DriverConfig::default()
    }
}

#[test]
fn test_hello_world_dispatch() {
    let board = SimulatedBoard::new().with_kernel(sim::add_element_number);
    let driver = Driver::open(board.clone(), board.clone(), config()).unwrap();

    let program = driver.program(&[0u8; 24]).unwrap();
    let mut result = driver.array::<u32>(&[NUM_THREADS, 16]).unwrap();
    let mut uniforms = driver.array::<u32>(&[NUM_THREADS, 2]).unwrap();
    result.fill(0);
    for thread in 0..NUM_THREADS {
        let out = result.row_address(thread).unwrap();
        let row = uniforms.row_mut(thread).unwrap();
        row[0] = (thread * 16) as u32;
        row[1] = out;
    }

    program.invoke(NUM_THREADS, &uniforms, Duration::from_millis(1000)).unwrap();

    for thread in 0..NUM_THREADS {
        let expected: Vec<u32> = (0..16).map(|lane| (thread * 16 + lane) as u32).collect();
        assert_eq!(result.row(thread).unwrap(), &expected[..], "row {}", thread);
    }
    for thread in 0..NUM_THREADS {
        assert_eq!(
            driver.message().row(thread),
            Some((uniforms.row_address(thread).unwrap(), program.address()))
        );
    }

    driver.close().unwrap();
    assert_eq!(board.live_allocations(), 0);
    assert!(!board.is_enabled());
}

#[test]
fn test_timeout_leaves_buffers_untouched() {
    let board = SimulatedBoard::new().with_kernel(sim::add_element_number);
    let driver = Driver::open(board.clone(), board.clone(), config()).unwrap();

    let program = driver.program(&[0u8; 8]).unwrap();
    let mut result = driver.array::<u32>(&[NUM_THREADS, 16]).unwrap();
    let mut uniforms = driver.array::<u32>(&[NUM_THREADS, 2]).unwrap();
    result.fill(0xFFFF_FFFF);
    for thread in 0..NUM_THREADS {
        let out = result.row_address(thread).unwrap();
        uniforms.row_mut(thread).unwrap().copy_from_slice(&[thread as u32, out]);
    }
    let uniforms_before = uniforms.as_slice().to_vec();

    board.set_execute_status(1);
    let err = program.invoke(8, &uniforms, Duration::from_millis(10)).unwrap_err();
    assert!(matches!(err, DriverError::ExecutionTimeout { timeout_ms: 10 }));

    assert!(result.as_slice().iter().all(|&v| v == 0xFFFF_FFFF));
    assert_eq!(uniforms.as_slice(), &uniforms_before[..]);
    // 32 uniform words over 8 threads: each thread starts 4 words further on.
    for thread in 0..8 {
        assert_eq!(
            driver.message().row(thread),
            Some((uniforms.address_of(thread * 4).unwrap(), program.address()))
        );
    }
}

#[test]
fn test_rollback_at_every_failure_point() {
    for point in [FailPoint::Enable, FailPoint::Allocate, FailPoint::Lock, FailPoint::Map] {
        let board = SimulatedBoard::new();
        board.fail_at(point);
        let err = Driver::open(board.clone(), board.clone(), config()).err();
        assert!(err.is_some(), "{:?} should fail", point);

        assert_eq!(board.live_allocations(), 0, "{:?}", point);
        assert_eq!(board.locked_count(), 0, "{:?}", point);
        assert_eq!(board.mapped_count(), 0, "{:?}", point);
        assert!(!board.is_enabled(), "{:?}", point);

        let calls = board.calls();
        let allocs = calls.iter().filter(|c| matches!(c, FirmwareCall::Allocate { .. })).count();
        let releases = calls.iter().filter(|c| matches!(c, FirmwareCall::Release(_))).count();
        let expected_releases = match point {
            FailPoint::Lock | FailPoint::Map => 1,
            _ => 0,
        };
        assert_eq!(releases, expected_releases, "{:?}", point);
        assert!(allocs >= releases);
    }
}

#[test]
fn test_bump_allocation_is_monotonic() {
    let board = SimulatedBoard::new();
    let driver = Driver::open(
        board.clone(),
        board,
        DriverConfig {
            data_area_size: 1024,
            code_area_size: 64,
            max_threads: 4,
        },
    )
    .unwrap();

    let mut ranges = Vec::new();
    let shapes: [&[usize]; 5] = [&[3], &[4, 4], &[7], &[2, 2, 2], &[1]];
    for shape in shapes {
        let arr = driver.array::<u32>(shape).unwrap();
        ranges.push((arr.offset(), arr.offset() + arr.nbytes()));
    }
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
        assert!(pair[0].0 < pair[1].0);
    }

    let pos = driver.layout().data_pos();
    assert!(driver.array::<u8>(&[1024]).is_err());
    assert_eq!(driver.layout().data_pos(), pos);

    let code_pos = driver.layout().code_pos();
    assert!(matches!(driver.program(&[0; 72]), Err(DriverError::ProgramTooLong { .. })));
    assert_eq!(driver.layout().code_pos(), code_pos);
}

#[test]
fn test_device_addresses_match_host_offsets() {
    let board = SimulatedBoard::new();
    let driver = Driver::open(board.clone(), board.clone(), config()).unwrap();
    let base = driver.base_address();

    let _pad = driver.array::<u8>(&[5]).unwrap();
    let mut arr = driver.array::<f32>(&[3, 4]).unwrap();
    for (flat, value) in arr.as_mut_slice().iter_mut().enumerate() {
        *value = flat as f32 * 0.5;
    }

    for row in 0..3 {
        for col in 0..4 {
            let flat = arr.flat_index(&[row, col]).unwrap();
            let addr = arr.address_at(&[row, col]).unwrap();
            assert_eq!(addr, base + (arr.offset() + flat * 4) as u32);
            assert_eq!(addr, arr.address_at(&[row, col]).unwrap());

            let bits = board.read_u32(addr).unwrap();
            assert_eq!(f32::from_bits(bits), arr.get(&[row, col]).unwrap());
        }
    }
}
