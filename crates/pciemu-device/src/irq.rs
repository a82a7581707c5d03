use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use pciemu_dma::GUEST_ERROR;
use pciemu_hw::IRQ_COUNT;

/// Platform side of the device's interrupt pins.
pub trait InterruptSink: Send + Sync {
    fn raise(&self, vector: u32);
    fn lower(&self, vector: u32);
}

/// Sink for a device that is not wired to a platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInterruptSink;

impl InterruptSink for NoopInterruptSink {
    fn raise(&self, _vector: u32) {}
    fn lower(&self, _vector: u32) {}
}

/// Level state of the device's interrupt vectors.
///
/// Edges are forwarded to the [`InterruptSink`]; repeated raises of an asserted vector are not.
pub struct IrqLine {
    asserted: Mutex<u32>,
    changed: Condvar,
    sink: Arc<dyn InterruptSink>,
}

impl IrqLine {
    pub fn new(sink: Arc<dyn InterruptSink>) -> Self {
        Self {
            asserted: Mutex::new(0),
            changed: Condvar::new(),
            sink,
        }
    }

    fn bit(vector: u32) -> Option<u32> {
        if (vector as usize) < IRQ_COUNT {
            Some(1 << vector)
        } else {
            tracing::warn!(target: GUEST_ERROR, vector, "interrupt vector out of range");
            None
        }
    }

    pub fn raise(&self, vector: u32) {
        let Some(bit) = Self::bit(vector) else { return };
        let mut asserted = self.asserted.lock().unwrap_or_else(PoisonError::into_inner);
        if *asserted & bit == 0 {
            *asserted |= bit;
            self.sink.raise(vector);
            tracing::debug!(vector, "irq raised");
        }
        drop(asserted);
        self.changed.notify_all();
    }

    pub fn lower(&self, vector: u32) {
        let Some(bit) = Self::bit(vector) else { return };
        let mut asserted = self.asserted.lock().unwrap_or_else(PoisonError::into_inner);
        if *asserted & bit != 0 {
            *asserted &= !bit;
            self.sink.lower(vector);
            tracing::debug!(vector, "irq lowered");
        }
    }

    pub fn lower_all(&self) {
        for vector in 0..IRQ_COUNT as u32 {
            self.lower(vector);
        }
    }

    /// Bitmap of asserted vectors.
    pub fn asserted(&self) -> u32 {
        *self.asserted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_asserted(&self, vector: u32) -> bool {
        vector < 32 && self.asserted() & (1 << vector) != 0
    }

    /// Block until `vector` is asserted or `timeout` passes. Returns whether it is asserted.
    pub fn wait_asserted(&self, vector: u32, timeout: Duration) -> bool {
        let Some(bit) = Self::bit(vector) else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        let mut asserted = self.asserted.lock().unwrap_or_else(PoisonError::into_inner);
        while *asserted & bit == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            asserted = self
                .changed
                .wait_timeout(asserted, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl std::fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqLine")
            .field("asserted", &self.asserted())
            .finish_non_exhaustive()
    }
}
