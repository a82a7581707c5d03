//! Host-driver side of the transfer contract.
//!
//! Mirrors what the kernel module does for `TX_WORK` and `TX_WAIT`: split a buffer into page
//! handles, program the descriptor registers, ring the doorbell, and later wait for the
//! completion interrupt.

use std::time::Duration;

use pciemu_hw::ioctl::TxRequest;
use pciemu_hw::{bar0, DMA_AREA_SIZE, DMA_MAX_HANDLES, IRQ_FINI, MODE_WORK, PAGE_SIZE};
use thiserror::Error;

use crate::{DeviceContext, MmioHandler};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("transfer request is empty")]
    Empty,

    #[error("transfer of {len} bytes exceeds the device window")]
    TooLarge { len: u64 },

    #[error("buffer at {addr:#x}+{len} wraps the address space")]
    AddressOverflow { addr: u64, len: u64 },

    #[error("timed out waiting for transfer completion")]
    Timeout,
}

/// Page handles covering a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPlan {
    /// Offset of the buffer inside its first page.
    pub offset: u64,
    pub len: u64,
    /// Page-aligned addresses, one per touched page.
    pub handles: Vec<u64>,
}

impl TxPlan {
    pub fn new(req: TxRequest) -> Result<Self, DriverError> {
        let TxRequest { addr, len } = req;
        if len == 0 {
            return Err(DriverError::Empty);
        }
        if len > DMA_AREA_SIZE {
            return Err(DriverError::TooLarge { len });
        }
        let end = addr
            .checked_add(len)
            .ok_or(DriverError::AddressOverflow { addr, len })?;

        let offset = addr % PAGE_SIZE;
        let first = addr - offset;
        let npages = (end - first).div_ceil(PAGE_SIZE);
        let handles = (0..npages).map(|i| first + i * PAGE_SIZE).collect();
        Ok(Self {
            offset,
            len,
            handles,
        })
    }

    pub fn npages(&self) -> u64 {
        self.handles.len() as u64
    }
}

/// `TX_WORK`: program a bulk-pull transfer of `req` and ring the doorbell.
pub fn tx_work(bar: &mut impl MmioHandler, req: TxRequest) -> Result<TxPlan, DriverError> {
    let plan = TxPlan::new(req)?;
    debug_assert!(plan.handles.len() <= DMA_MAX_HANDLES);

    bar.write(bar0::DMA_CFG_PGS, 8, plan.npages());
    for (i, &handle) in plan.handles.iter().enumerate() {
        bar.write(bar0::DMA_WORK_AREA_START + 8 * i as u64, 8, handle);
    }
    bar.write(bar0::DMA_CFG_OFS, 8, plan.offset);
    bar.write(bar0::DMA_CFG_LEN, 8, plan.len);
    bar.write(bar0::DMA_CFG_MODE, 8, MODE_WORK);
    bar.write(bar0::DMA_DOORBELL_RING, 8, 1);
    tracing::debug!(npages = plan.npages(), len = plan.len, "transfer submitted");
    Ok(plan)
}

/// `TX_WAIT`: block until the completion interrupt fires, acknowledge it, and report how many
/// bytes the peer delivered.
pub fn tx_wait(ctx: &DeviceContext, timeout: Duration) -> Result<u64, DriverError> {
    if !ctx.irq().wait_asserted(IRQ_FINI, timeout) {
        return Err(DriverError::Timeout);
    }
    ctx.irq().lower(IRQ_FINI);
    Ok(ctx.completed_len())
}
