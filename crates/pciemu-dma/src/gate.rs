use std::sync::{Condvar, Mutex};

use pciemu_hw::PAGE_SIZE;

use crate::descriptor::DescriptorHeader;
use crate::engine::{DmaEngine, DmaStatus};
use crate::{lock, DmaError, GateError};

/// Descriptor and buffer received from the peer, waiting to be merged into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSync {
    pub descriptor: DescriptorHeader,
    pub data: Vec<u8>,
}

impl StagedSync {
    /// Stage a raw payload; the descriptor describes it as page-aligned data.
    pub fn from_payload(data: Vec<u8>) -> Self {
        let length = data.len() as u64;
        Self {
            descriptor: DescriptorHeader {
                npages: length.div_ceil(PAGE_SIZE),
                offset: 0,
                length,
                mode: 0,
            },
            data,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<StagedSync>,
    closed: bool,
}

/// Single-slot mailbox between the thread receiving `Sync` payloads and the context allowed to
/// mutate the engine.
///
/// At most one payload is pending. [`SyncGate::stage`] blocks while the slot is full;
/// [`SyncGate::try_stage`] rejects instead.
#[derive(Debug, Default)]
pub struct SyncGate {
    slot: Mutex<Slot>,
    emptied: Condvar,
}

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `staged` in the gate, waiting for a pending payload to be applied first.
    pub fn stage(&self, staged: StagedSync) -> Result<(), GateError> {
        let slot = lock(&self.slot);
        let mut slot = self
            .emptied
            .wait_while(slot, |s| s.pending.is_some() && !s.closed)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.closed {
            return Err(GateError::Closed);
        }
        slot.pending = Some(staged);
        Ok(())
    }

    /// Non-blocking [`SyncGate::stage`]. A rejected payload is dropped.
    pub fn try_stage(&self, staged: StagedSync) -> Result<(), GateError> {
        let mut slot = lock(&self.slot);
        if slot.closed {
            return Err(GateError::Closed);
        }
        if slot.pending.is_some() {
            return Err(GateError::Full);
        }
        slot.pending = Some(staged);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }

    pub fn take(&self) -> Option<StagedSync> {
        let staged = lock(&self.slot).pending.take();
        if staged.is_some() {
            self.emptied.notify_all();
        }
        staged
    }

    /// Merge the pending payload into `engine` unless a transfer is executing.
    ///
    /// Returns the number of bytes applied, or `None` when nothing was applied (empty gate or
    /// engine busy; a busy engine keeps the payload pending).
    pub fn apply_to(&self, engine: &DmaEngine) -> Result<Option<usize>, DmaError> {
        let mut slot = lock(&self.slot);
        if engine.status() == DmaStatus::Executing {
            return Ok(None);
        }
        let Some(staged) = slot.pending.take() else {
            return Ok(None);
        };

        let result = match engine.apply_sync(&staged) {
            Ok(n) => Ok(Some(n)),
            Err(DmaError::Busy) => {
                slot.pending = Some(staged);
                return Ok(None);
            }
            Err(err) => Err(err),
        };
        drop(slot);
        self.emptied.notify_all();
        result
    }

    /// Wake and fail every current and future `stage` call.
    pub fn close(&self) {
        let mut slot = lock(&self.slot);
        slot.closed = true;
        slot.pending = None;
        drop(slot);
        self.emptied.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.slot).closed
    }
}
