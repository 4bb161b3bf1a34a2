//! Rollback of partially acquired firmware resources.
//!
//! Acquisition pushes one `Step` per completed request. If the guard is
//! dropped without `commit`, the completed steps are undone in reverse order.
//! Mapping is always the last step, so it never needs undoing here.

use crate::firmware::Firmware;

/// One completed acquisition step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    QpuEnabled,
    Allocated(u32),
    Locked(u32),
}

/// RAII guard that undoes completed steps unless committed.
pub(crate) struct Unwind<'a, F: Firmware + ?Sized> {
    firmware: &'a F,
    steps: Vec<Step>,
}

impl<'a, F: Firmware + ?Sized> Unwind<'a, F> {
    pub(crate) fn new(firmware: &'a F) -> Self {
        Self {
            firmware,
            steps: Vec::with_capacity(4),
        }
    }

    pub(crate) fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Keep everything acquired so far.
    pub(crate) fn commit(mut self) {
        self.steps.clear();
    }

    fn undo(&self, step: Step) {
        let result = match step {
            Step::QpuEnabled => self.firmware.enable_qpu(false),
            Step::Allocated(handle) => self.firmware.release_memory(handle),
            Step::Locked(handle) => self.firmware.unlock_memory(handle),
        };
        match result {
            Ok(()) => log::debug!("[unwind] Rolled back {:?}", step),
            Err(e) => log::error!("[unwind] Failed to roll back {:?}: {}", step, e),
        }
    }
}

impl<F: Firmware + ?Sized> Drop for Unwind<'_, F> {
    fn drop(&mut self) {
        while let Some(step) = self.steps.pop() {
            self.undo(step);
        }
    }
}
