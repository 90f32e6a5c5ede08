//! Per-connection record of the realized schedule.

use std::cell::RefCell;
use std::rc::Rc;

/// Single-slot store of the `beta` sequence of the current or most
/// recent run on one connection.
///
/// Clones share the slot, so a handle kept by the transport can be
/// queried while the session that fills it is running. Single-threaded,
/// like the session driver.
#[derive(Debug, Clone, Default)]
pub struct ScheduleSlot {
    betas: Rc<RefCell<Vec<f64>>>,
}

impl ScheduleSlot {
    /// An empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous run.
    pub fn clear(&self) {
        self.betas.borrow_mut().clear();
    }

    /// Record one processed step.
    pub fn push(&self, beta: f64) {
        self.betas.borrow_mut().push(beta);
    }

    /// Copy of the recorded sequence, in step order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<f64> {
        self.betas.borrow().clone()
    }

    /// Number of recorded steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.betas.borrow().len()
    }

    /// Returns `true` before any step has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.betas.borrow().is_empty()
    }
}
