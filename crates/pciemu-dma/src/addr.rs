use pciemu_hw::{DMA_ADDR_CAPABILITY, DMA_AREA_SIZE, DMA_AREA_START};

use crate::GUEST_ERROR;

/// Mask covering the low `bits` address bits.
pub const fn dma_bit_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Bus address capability of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMask {
    bits: u32,
    mask: u64,
}

impl AddressMask {
    pub const fn new(bits: u32) -> Self {
        Self {
            bits,
            mask: dma_bit_mask(bits),
        }
    }

    /// The capability declared in the datasheet.
    pub const fn device() -> Self {
        Self::new(DMA_ADDR_CAPABILITY)
    }

    pub const fn bits(&self) -> u32 {
        self.bits
    }

    pub const fn value(&self) -> u64 {
        self.mask
    }

    pub const fn fits(&self, addr: u64) -> bool {
        addr & !self.mask == 0
    }

    /// Truncate `addr` to the capability width.
    ///
    /// An address with bits above the width is a guest error; it is logged and the truncated
    /// address is still returned.
    pub fn apply(&self, addr: u64) -> u64 {
        let masked = addr & self.mask;
        if masked != addr {
            tracing::warn!(
                target: GUEST_ERROR,
                "masked ({masked:#x}) != addr ({addr:#x})"
            );
        }
        masked
    }
}

impl Default for AddressMask {
    fn default() -> Self {
        Self::device()
    }
}

/// Whether `addr` lies inside the device window.
///
/// The window end itself is accepted so that `start + len` can be checked for a transfer that
/// fills the window exactly.
pub const fn in_bounds(addr: u64) -> bool {
    DMA_AREA_START <= addr && addr <= DMA_AREA_START + DMA_AREA_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_mask_edges() {
        assert_eq!(dma_bit_mask(0), 0);
        assert_eq!(dma_bit_mask(32), 0xffff_ffff);
        assert_eq!(dma_bit_mask(64), u64::MAX);
    }

    #[test]
    fn device_mask_truncates_high_bits() {
        let mask = AddressMask::device();
        assert_eq!(mask.bits(), 32);
        assert_eq!(mask.apply(0x1_2345_6000), 0x2345_6000);
        assert_eq!(mask.apply(0x8000_0000), 0x8000_0000);
        assert!(!mask.fits(0x1_0000_0000));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        assert!(!in_bounds(DMA_AREA_START - 1));
        assert!(in_bounds(DMA_AREA_START));
        assert!(in_bounds(DMA_AREA_START + DMA_AREA_SIZE));
        assert!(!in_bounds(DMA_AREA_START + DMA_AREA_SIZE + 1));
    }
}
