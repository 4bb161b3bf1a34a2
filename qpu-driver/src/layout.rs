//! Partitioning of the device memory region.
//!
//! ```text
//! 0                     code_size          code_size + data_size
//! ┌─────────────────────┬──────────────────┬───────────────────────┐
//! │ code area           │ data area        │ message area          │
//! │ (programs, append)  │ (arrays, append) │ max_threads x 8 bytes │
//! └─────────────────────┴──────────────────┴───────────────────────┘
//! ```
//!
//! Code and data areas are bump-allocated; neither cursor ever moves back.

use std::cell::Cell;

use crate::config::INSTRUCTION_SIZE;
use crate::error::{DriverError, Result};
use crate::message::MESSAGE_ROW_SIZE;

/// Sub-area boundaries and write cursors, all as byte offsets into the region.
#[derive(Debug)]
pub struct MemoryLayout {
    code_base: usize,
    data_base: usize,
    message_base: usize,
    total: usize,
    code_pos: Cell<usize>,
    data_pos: Cell<usize>,
}

impl MemoryLayout {
    /// Returns `None` if the total size overflows `usize`.
    pub fn new(code_area_size: usize, data_area_size: usize, max_threads: usize) -> Option<Self> {
        let code_base = 0;
        let data_base = code_base + code_area_size;
        let message_base = data_base.checked_add(data_area_size)?;
        let total = max_threads
            .checked_mul(MESSAGE_ROW_SIZE)?
            .checked_add(message_base)?;
        Some(Self {
            code_base,
            data_base,
            message_base,
            total,
            code_pos: Cell::new(code_base),
            data_pos: Cell::new(data_base),
        })
    }

    pub fn code_base(&self) -> usize {
        self.code_base
    }

    pub fn data_base(&self) -> usize {
        self.data_base
    }

    pub fn message_base(&self) -> usize {
        self.message_base
    }

    /// Size of the whole region.
    pub fn total_size(&self) -> usize {
        self.total
    }

    /// Next free byte in the code area.
    pub fn code_pos(&self) -> usize {
        self.code_pos.get()
    }

    /// Next free byte in the data area.
    pub fn data_pos(&self) -> usize {
        self.data_pos.get()
    }

    /// Claim `len` bytes of the code area; returns their offset.
    ///
    /// Claims are rounded up to whole instructions, and an empty request
    /// still takes one, so every offset handed out is instruction-aligned
    /// and greater than the one before it.
    pub fn reserve_code(&self, len: usize) -> Result<usize> {
        let start = self.code_pos.get();
        let available = self.data_base - start;
        let too_long = || DriverError::ProgramTooLong {
            requested: len,
            available,
        };

        let claimed = len
            .max(1)
            .checked_next_multiple_of(INSTRUCTION_SIZE)
            .ok_or_else(too_long)?;
        if claimed > available {
            return Err(too_long());
        }
        self.code_pos.set(start + claimed);
        Ok(start)
    }

    /// Claim `len` bytes of the data area starting on an `align` boundary;
    /// returns their offset. Alignment padding counts against the area, and
    /// an empty request still takes one byte.
    pub fn reserve_data(&self, len: usize, align: usize) -> Result<usize> {
        let pos = self.data_pos.get();
        let available = self.message_base - pos;
        let too_large = || DriverError::ArrayTooLarge {
            requested: len,
            available,
        };

        let start = pos.checked_next_multiple_of(align.max(1)).ok_or_else(too_large)?;
        let end = start.checked_add(len.max(1)).ok_or_else(too_large)?;
        if end > self.message_base {
            return Err(too_large());
        }
        self.data_pos.set(end);
        Ok(start)
    }
}
