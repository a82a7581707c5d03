use std::sync::Mutex;

use crate::{lock, MemoryError};

/// Host memory reachable by bus-master DMA.
///
/// Implementations are shared between the device owner and the DMA engine, hence `&self` access
/// and the `Send + Sync` bound.
pub trait GuestMemory: Send + Sync {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write_physical(&self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError>;
}

/// Flat RAM starting at physical address 0.
///
/// Used by tests and by the stand-alone proxy peer, which have no real guest behind them.
pub struct FlatMemory {
    bytes: Mutex<Vec<u8>>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0u8; size]),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range(
        len_total: usize,
        paddr: u64,
        len: usize,
    ) -> Result<std::ops::Range<usize>, MemoryError> {
        let oob = MemoryError::OutOfBounds { addr: paddr, len };
        let start = usize::try_from(paddr).map_err(|_| oob.clone())?;
        let end = start.checked_add(len).ok_or_else(|| oob.clone())?;
        if end > len_total {
            return Err(oob);
        }
        Ok(start..end)
    }
}

impl GuestMemory for FlatMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let bytes = lock(&self.bytes);
        let range = Self::range(bytes.len(), paddr, buf.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write_physical(&self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let mut bytes = lock(&self.bytes);
        let range = Self::range(bytes.len(), paddr, buf.len())?;
        bytes[range].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accesses_past_the_end_fail() {
        let mem = FlatMemory::new(0x100);
        let mut buf = [0u8; 4];
        assert!(mem.read_physical(0xfc, &mut buf).is_ok());
        assert_eq!(
            mem.read_physical(0xfd, &mut buf),
            Err(MemoryError::OutOfBounds { addr: 0xfd, len: 4 })
        );
        assert!(mem.write_physical(u64::MAX, &buf).is_err());
    }
}
