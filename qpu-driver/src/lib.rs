//! Host-side driver for the VideoCore IV QPUs.
//!
//! The driver acquires one block of GPU memory from the firmware, maps it
//! into the process, and hands out typed DMA arrays and program slots from
//! it. Programs are launched through a message table of per-thread
//! `(uniforms, code)` bus addresses.
//!
//! ```no_run
//! use std::time::Duration;
//! use qpu_driver::{Driver, DriverConfig, SimulatedBoard};
//!
//! # fn main() -> Result<(), qpu_driver::DriverError> {
//! let board = SimulatedBoard::new();
//! let driver = Driver::open(board.clone(), board, DriverConfig::default())?;
//! let program = driver.program(&[0u8; 8])?;
//! let uniforms = driver.array::<u32>(&[16, 2])?;
//! program.invoke(16, &uniforms, Duration::from_secs(1))?;
//! driver.close()?;
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod config;
pub mod driver;
pub mod error;
pub mod firmware;
pub mod layout;
pub mod message;
pub mod phys;
pub mod program;
pub mod region;
pub mod sim;

mod unwind;

pub use array::{Array, Element};
pub use config::DriverConfig;
pub use driver::Driver;
pub use error::{DriverError, FirmwareError, Result};
pub use firmware::Firmware;
pub use phys::{DevMem, PhysicalMemory};
pub use program::{Assemble, Program, ProgramSource};
pub use region::Region;
pub use sim::SimulatedBoard;
