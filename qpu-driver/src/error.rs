use std::io;

use thiserror::Error;

/// Errors reported by a firmware channel implementation.
///
/// These are transport-level failures. Semantic failures of the memory
/// operations (a zero handle, a zero lock address) are mapped to the
/// matching `DriverError` by the region code.
#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("Firmware channel I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Firmware rejected {op} (status {status:#x})")]
    Rejected { op: &'static str, status: u32 },
}

/// Every failure the driver can report.
///
/// Acquisition failures (`AllocationFailed`, `LockFailed`, `MapFailed`) are
/// raised only after the completed steps were rolled back. Boundary failures
/// (`ArrayTooLarge`, `ProgramTooLong`, `InvalidThreadCount`, `UniformShape`)
/// leave the driver exactly as it was before the call.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Failed to allocate {size} bytes of QPU device memory")]
    AllocationFailed { size: usize },

    #[error("Failed to lock device memory handle {handle:#x}")]
    LockFailed { handle: u32 },

    #[error("Failed to map device memory at bus address {address:#010x}: {source}")]
    MapFailed {
        address: u32,
        #[source]
        source: io::Error,
    },

    #[error("Array too large: {requested} bytes requested, {available} bytes left in data area")]
    ArrayTooLarge { requested: usize, available: usize },

    #[error("Program too long: {requested} bytes requested, {available} bytes left in code area")]
    ProgramTooLong { requested: usize, available: usize },

    #[error("num_threads must be in range (1 .. {max}), got {count}")]
    InvalidThreadCount { count: usize, max: usize },

    #[error("QPU execution timeout after {timeout_ms} ms")]
    ExecutionTimeout { timeout_ms: u32 },

    #[error("Uniform array of {elements} elements cannot be split across {threads} threads")]
    UniformShape { elements: usize, threads: usize },

    #[error("QPU state is undefined after a timeout; call Driver::reset() first")]
    ResetRequired,

    #[error("Invalid driver configuration: {0}")]
    InvalidConfig(String),

    #[error("Kernel assembly failed: {0}")]
    Assembly(String),

    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    #[error("Failed to parse driver configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
