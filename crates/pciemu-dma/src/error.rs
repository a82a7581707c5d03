use thiserror::Error;

/// Guest memory access failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("out of bounds: addr={addr:#x} len={len}")]
    OutOfBounds { addr: u64, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
    /// The engine was finalized; it never leaves `Off`.
    #[error("DMA engine is retired")]
    Retired,

    #[error("DMA engine is executing a transfer")]
    Busy,

    #[error("empty transfer descriptor (npages={npages}, length={length})")]
    EmptyDescriptor { npages: u64, length: u64 },

    #[error("invalid transfer mode {0:#x}")]
    InvalidMode(u64),

    #[error("transfer of {length} bytes does not fit the device window")]
    WindowOverflow { length: u64 },

    #[error("first page offset {offset:#x} is not inside a page")]
    OffsetOutOfPage { offset: u64 },

    #[error("page count {0} exceeds the handle table")]
    TooManyPages(u64),

    #[error("page handle index {0} is outside the work area")]
    HandleOutOfRange(usize),

    #[error("guest memory access failed: {0}")]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("a synced buffer is already pending")]
    Full,

    #[error("sync gate is closed")]
    Closed,
}
