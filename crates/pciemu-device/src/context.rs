use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use pciemu_dma::SyncGate;
use pciemu_proxy::LinkHooks;

use crate::irq::{InterruptSink, IrqLine};

/// State shared between a device and its proxy link thread.
///
/// The link only sets flags and stages payloads here; [`crate::PciEmuDevice::poll`] acts on them.
#[derive(Debug)]
pub struct DeviceContext {
    reset_pending: AtomicBool,
    notify_pending: AtomicBool,
    /// Length of the last payload merged into the window.
    completed_len: AtomicU64,
    irq: IrqLine,
    gate: Arc<SyncGate>,
}

impl DeviceContext {
    pub fn new(sink: Arc<dyn InterruptSink>) -> Self {
        Self {
            reset_pending: AtomicBool::new(false),
            notify_pending: AtomicBool::new(false),
            completed_len: AtomicU64::new(0),
            irq: IrqLine::new(sink),
            gate: Arc::new(SyncGate::new()),
        }
    }

    pub fn irq(&self) -> &IrqLine {
        &self.irq
    }

    pub fn gate(&self) -> &Arc<SyncGate> {
        &self.gate
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending.load(Ordering::Acquire)
    }

    pub fn completed_len(&self) -> u64 {
        self.completed_len.load(Ordering::Acquire)
    }

    pub(crate) fn take_reset(&self) -> bool {
        self.reset_pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_notify(&self) -> bool {
        self.notify_pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn defer_notify(&self) {
        self.notify_pending.store(true, Ordering::Release);
    }

    pub(crate) fn set_completed_len(&self, len: u64) {
        self.completed_len.store(len, Ordering::Release);
    }
}

impl LinkHooks for DeviceContext {
    fn schedule_reset(&self) {
        tracing::debug!("peer scheduled a device reset");
        self.reset_pending.store(true, Ordering::Release);
    }

    fn raise_completion_irq(&self) {
        tracing::debug!("peer signalled transfer completion");
        self.notify_pending.store(true, Ordering::Release);
    }
}
