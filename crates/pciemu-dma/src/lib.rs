//! DMA engine of the pciemu device.
//!
//! The engine owns a transfer descriptor, a status register and the device-internal window. A
//! doorbell moves it from `Idle` to `Executing`, the configured page handles are walked and copied
//! into the window, and each copied page is announced to the proxy link by pushing a
//! [`ProxyRequest::Sync`] into the shared [`RequestQueue`]. Payloads arriving from the peer take
//! the opposite path through the [`SyncGate`].
#![forbid(unsafe_code)]

mod addr;
mod descriptor;
mod engine;
mod error;
mod gate;
mod memory;
mod queue;

pub use addr::{dma_bit_mask, in_bounds, AddressMask};
pub use descriptor::{DescriptorHeader, PageSpan, PageWalk, TransferDescriptor, TransferMode};
pub use engine::{Doorbell, DmaEngine, DmaStatus, EngineContext, TransferReport};
pub use error::{DmaError, GateError, MemoryError};
pub use gate::{StagedSync, SyncGate};
pub use memory::{FlatMemory, GuestMemory};
pub use queue::RequestQueue;

pub use pciemu_proxy_protocol::ProxyRequest;

/// `tracing` target used for diagnostics caused by a misbehaving guest.
///
/// Guest errors never abort the device; they are only logged.
pub const GUEST_ERROR: &str = "pciemu::guest_error";

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
