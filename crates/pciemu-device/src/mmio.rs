use pciemu_hw::bar0;

/// Memory-mapped register window.
pub trait MmioHandler {
    fn read(&mut self, offset: u64, size: usize) -> u64;
    fn write(&mut self, offset: u64, size: usize, value: u64);
}

/// A naturally aligned 1/2/4/8 byte access inside one 64-bit BAR0 register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Access {
    /// Offset of the containing register.
    pub reg: u64,
    shift: u32,
    mask: u64,
}

impl Access {
    pub fn decode(offset: u64, size: usize) -> Option<Self> {
        let mask = match size {
            1 => 0xff,
            2 => 0xffff,
            4 => 0xffff_ffff,
            8 => u64::MAX,
            _ => return None,
        };
        let size = size as u64;
        if offset % size != 0 || offset.checked_add(size)? > bar0::END {
            return None;
        }
        Some(Self {
            reg: offset & !7,
            shift: ((offset & 7) * 8) as u32,
            mask,
        })
    }

    pub fn is_full(&self) -> bool {
        self.mask == u64::MAX
    }

    /// The accessed bytes of a register value.
    pub fn extract(&self, reg_value: u64) -> u64 {
        (reg_value >> self.shift) & self.mask
    }

    /// `current` with the accessed bytes replaced by `value`.
    pub fn merge(&self, current: u64, value: u64) -> u64 {
        let field = self.mask << self.shift;
        (current & !field) | ((value & self.mask) << self.shift)
    }

    /// The written bytes, as seen by a command register.
    pub fn command(&self, value: u64) -> u64 {
        value & self.mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_bad_sizes_and_alignment() {
        assert!(Access::decode(0, 3).is_none());
        assert!(Access::decode(0x2, 4).is_none());
        assert!(Access::decode(bar0::END, 1).is_none());
        assert!(Access::decode(bar0::END - 8, 8).is_some());
    }

    #[test]
    fn partial_accesses_address_register_bytes() {
        let hi = Access::decode(bar0::REG_1 + 4, 4).unwrap();
        assert_eq!(hi.reg, bar0::REG_1);
        assert_eq!(hi.extract(0x1122_3344_5566_7788), 0x1122_3344);
        assert_eq!(
            hi.merge(0x1122_3344_5566_7788, 0xaabb_ccdd),
            0xaabb_ccdd_5566_7788
        );

        let byte = Access::decode(bar0::REG_0 + 1, 1).unwrap();
        assert_eq!(byte.merge(0, 0x1ff), 0xff00);
        assert!(!byte.is_full());
    }
}
