use pciemu_hw::{DMA_MAX_HANDLES, MODE_WATCH, MODE_WORK, PAGE_SIZE};

use crate::DmaError;

/// Decoded value of the mode register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Pull the descriptor pages into the device window and forward them to the peer.
    Work,
    /// Expose descriptor pages to data delivered by the peer.
    Watch,
}

impl TransferMode {
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            MODE_WORK => Some(Self::Work),
            MODE_WATCH => Some(Self::Watch),
            _ => None,
        }
    }

    pub const fn raw(self) -> u64 {
        match self {
            Self::Work => MODE_WORK,
            Self::Watch => MODE_WATCH,
        }
    }
}

/// Scalar part of a transfer descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorHeader {
    pub npages: u64,
    pub offset: u64,
    pub length: u64,
    /// Raw mode register; see [`TransferMode::from_raw`].
    pub mode: u64,
}

impl DescriptorHeader {
    pub fn mode(&self) -> Option<TransferMode> {
        TransferMode::from_raw(self.mode)
    }
}

/// Configuration written by the guest before ringing the doorbell.
pub struct TransferDescriptor {
    header: DescriptorHeader,
    handles: Box<[u64]>,
}

impl TransferDescriptor {
    pub fn new() -> Self {
        Self {
            header: DescriptorHeader::default(),
            handles: vec![0u64; DMA_MAX_HANDLES].into_boxed_slice(),
        }
    }

    pub fn header(&self) -> DescriptorHeader {
        self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut DescriptorHeader {
        &mut self.header
    }

    /// The whole handle table, including slots beyond `npages`.
    pub fn handles(&self) -> &[u64] {
        &self.handles
    }

    /// Handles covered by the configured page count.
    pub fn active_handles(&self) -> &[u64] {
        let n = usize::try_from(self.header.npages)
            .unwrap_or(usize::MAX)
            .min(self.handles.len());
        &self.handles[..n]
    }

    pub fn handle(&self, index: usize) -> Option<u64> {
        self.handles.get(index).copied()
    }

    pub(crate) fn set_handle(&mut self, index: usize, addr: u64) -> Result<(), DmaError> {
        let slot = self
            .handles
            .get_mut(index)
            .ok_or(DmaError::HandleOutOfRange(index))?;
        *slot = addr;
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.header = DescriptorHeader::default();
        self.handles.fill(0);
    }

    pub fn is_zeroed(&self) -> bool {
        self.header == DescriptorHeader::default() && self.handles.iter().all(|&h| h == 0)
    }
}

impl Default for TransferDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransferDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferDescriptor")
            .field("header", &self.header)
            .field("active_handles", &self.active_handles())
            .finish()
    }
}

/// One page worth of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    /// Index into the handle table.
    pub index: usize,
    /// Byte offset inside the page where the span starts.
    pub page_offset: u64,
    pub len: u64,
}

/// Splits `length` bytes starting `offset` bytes into the first page across `npages` pages.
///
/// The first page contributes `min(remaining, PAGE_SIZE - offset)` bytes, every later page
/// `min(remaining, PAGE_SIZE)`. Iteration stops once the length is consumed or the pages run
/// out; [`PageWalk::remaining`] then reports what did not fit.
#[derive(Debug, Clone)]
pub struct PageWalk {
    offset: u64,
    remaining: u64,
    index: usize,
    npages: usize,
}

impl PageWalk {
    pub fn new(offset: u64, length: u64, npages: usize) -> Self {
        Self {
            offset,
            remaining: length,
            index: 0,
            npages,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Iterator for PageWalk {
    type Item = PageSpan;

    fn next(&mut self) -> Option<PageSpan> {
        if self.remaining == 0 || self.index >= self.npages {
            return None;
        }
        let take = self.remaining.min(PAGE_SIZE.saturating_sub(self.offset));
        let span = PageSpan {
            index: self.index,
            page_offset: self.offset,
            len: take,
        };
        self.offset = 0;
        self.remaining -= take;
        self.index += 1;
        Some(span)
    }
}
