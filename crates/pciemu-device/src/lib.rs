//! pciemu PCI device model.
//!
//! [`PciEmuDevice`] decodes BAR0 accesses into the general registers, the interrupt registers and
//! the DMA engine configuration, and wires the engine to a proxy link. Work arriving from the link
//! thread is recorded in the shared [`DeviceContext`] and carried out by [`PciEmuDevice::poll`]
//! on the device owner's thread.
#![forbid(unsafe_code)]

mod context;
mod device;
pub mod driver;
mod error;
mod irq;
mod mmio;

pub use context::DeviceContext;
pub use device::{PciEmuDevice, PollOutcome};
pub use error::DeviceError;
pub use irq::{InterruptSink, IrqLine, NoopInterruptSink};
pub use mmio::MmioHandler;

pub use pciemu_dma::{FlatMemory, GuestMemory, ProxyRequest};
pub use pciemu_proxy::{LinkConfig, LinkRole};
