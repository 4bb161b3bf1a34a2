//! Driver sizing.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};
use crate::layout::MemoryLayout;

pub const DEFAULT_MAX_THREADS: usize = 1024;
pub const DEFAULT_DATA_AREA_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_CODE_AREA_SIZE: usize = 1024 * 1024;

/// QPU instructions are 64 bits wide.
pub const INSTRUCTION_SIZE: usize = 8;

/// Sizes of the three sub-areas of the device memory region.
///
/// Missing fields in a JSON document take their default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Bytes available to `Driver::array`.
    pub data_area_size: usize,
    /// Bytes available to `Driver::program`.
    pub code_area_size: usize,
    /// Upper bound on threads per launch; sizes the message area.
    pub max_threads: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            data_area_size: DEFAULT_DATA_AREA_SIZE,
            code_area_size: DEFAULT_CODE_AREA_SIZE,
            max_threads: DEFAULT_MAX_THREADS,
        }
    }
}

impl DriverConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DriverConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check the sizes describe a region the firmware can hand out and the
    /// message table can be word-aligned in.
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(DriverError::InvalidConfig("max_threads must be at least 1".into()));
        }
        if self.code_area_size % INSTRUCTION_SIZE != 0 {
            return Err(DriverError::InvalidConfig(format!(
                "code_area_size {} is not a multiple of {}",
                self.code_area_size, INSTRUCTION_SIZE
            )));
        }
        if self.data_area_size % 4 != 0 {
            return Err(DriverError::InvalidConfig(format!(
                "data_area_size {} is not a multiple of 4",
                self.data_area_size
            )));
        }
        match self.layout() {
            Some(layout) if layout.total_size() <= u32::MAX as usize => Ok(()),
            _ => Err(DriverError::InvalidConfig(
                "total device memory does not fit the 32-bit bus address space".into(),
            )),
        }
    }

    /// Fresh layout for these sizes, or `None` if they overflow.
    pub fn layout(&self) -> Option<MemoryLayout> {
        MemoryLayout::new(self.code_area_size, self.data_area_size, self.max_threads)
    }

    /// Bytes requested from the firmware.
    pub fn total_size(&self) -> Option<usize> {
        self.layout().map(|l| l.total_size())
    }
}
