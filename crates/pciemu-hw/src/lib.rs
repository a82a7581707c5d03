#![forbid(unsafe_code)]

//! Hardware resources of the pciemu PCI device.
//!
//! This crate acts as the device datasheet: the device model (`pciemu-device`), the DMA engine
//! (`pciemu-dma`) and any host-side driver code agree on register offsets and DMA constants by
//! importing them from here.

/// Vendor/device IDs from the QEMU reserved range (`docs/specs/pci-ids.txt`).
pub const PCIEMU_VENDOR_ID: u16 = 0x1b36;
pub const PCIEMU_DEVICE_ID: u16 = 0x1100;
pub const PCIEMU_REVISION: u8 = 0x01;

pub const BAR0: u8 = 0;
pub const BAR_COUNT: usize = 1;

/// BAR0 register map.
///
/// All registers are 64 bits wide and 8-byte aligned.
pub mod bar0 {
    pub const REG_COUNT: usize = 4;
    pub const REG_0: u64 = 0x00;
    pub const REG_1: u64 = 0x08;
    pub const REG_2: u64 = 0x10;
    pub const REG_3: u64 = 0x18;

    pub const IRQ_0_RAISE: u64 = 0x20;
    pub const IRQ_0_LOWER: u64 = 0x28;

    /// Transfer length, in bytes.
    pub const DMA_CFG_LEN: u64 = 0x30;
    /// Number of page handles populated in the work area.
    pub const DMA_CFG_PGS: u64 = 0x38;
    /// Transfer mode ([`super::MODE_WORK`] or [`super::MODE_WATCH`]).
    pub const DMA_CFG_MODE: u64 = 0x40;
    pub const DMA_DOORBELL_RING: u64 = 0x48;
    /// Byte offset of the transfer inside the first page.
    pub const DMA_CFG_OFS: u64 = 0x50;

    /// Page handle table. Handle `i` lives at `DMA_WORK_AREA_START + 8 * i`.
    pub const DMA_WORK_AREA_START: u64 = 0x58;
    pub const DMA_WORK_AREA_SIZE: u64 = 0x20_0000;

    pub const START: u64 = REG_0;
    pub const END: u64 = DMA_WORK_AREA_START + DMA_WORK_AREA_SIZE;

    /// Size of the BAR0 MMIO region in bytes, rounded up to a power of two as PCI requires.
    pub const SIZE: u64 = END.next_power_of_two();
}

/// Number of page handles that fit into the work area.
pub const DMA_MAX_HANDLES: usize = (bar0::DMA_WORK_AREA_SIZE / 8) as usize;

/// Width of the bus addresses the device can generate.
pub const DMA_ADDR_CAPABILITY: u32 = 32;

/// Device-internal DMA window, expressed in the device address space.
pub const DMA_AREA_START: u64 = 0x1_0000;
pub const DMA_AREA_SIZE: u64 = 0x4000;

/// Page granularity used when walking page handles.
pub const PAGE_SIZE: u64 = 0x1000;

pub const MODE_WORK: u64 = 0x1;
pub const MODE_WATCH: u64 = 0x2;

pub const IRQ_COUNT: usize = 1;
/// Vector raised when a transfer finished on the peer side.
pub const IRQ_FINI: u32 = 0;

/// Contract of the host kernel driver front end.
///
/// The character device itself lives outside this workspace; these values document what user
/// space passes in and what the driver translates into BAR0 writes.
pub mod ioctl {
    pub const MAGIC: u8 = 0xE1;
    /// Start working on the memory described by a [`TxRequest`].
    pub const TX_WORK: u8 = 1;
    /// Wait for the previous transfer to finish and report its size.
    pub const TX_WAIT: u8 = 2;

    /// Input/output buffer handed to `TX_WORK`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxRequest {
        pub addr: u64,
        pub len: u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_registers_precede_work_area() {
        let regs = [
            bar0::REG_0,
            bar0::REG_1,
            bar0::REG_2,
            bar0::REG_3,
            bar0::IRQ_0_RAISE,
            bar0::IRQ_0_LOWER,
            bar0::DMA_CFG_LEN,
            bar0::DMA_CFG_PGS,
            bar0::DMA_CFG_MODE,
            bar0::DMA_DOORBELL_RING,
            bar0::DMA_CFG_OFS,
        ];
        for pair in regs.windows(2) {
            assert_eq!(pair[1] - pair[0], 8);
        }
        assert_eq!(bar0::DMA_CFG_OFS + 8, bar0::DMA_WORK_AREA_START);
        assert!(bar0::SIZE >= bar0::END);
        assert!(bar0::SIZE.is_power_of_two());
    }

    #[test]
    fn window_holds_whole_pages() {
        assert_eq!(DMA_AREA_SIZE % PAGE_SIZE, 0);
        assert_eq!(DMA_MAX_HANDLES, 0x4_0000);
    }
}
