use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pciemu_hw::{DMA_ADDR_CAPABILITY, DMA_AREA_SIZE, DMA_AREA_START, DMA_MAX_HANDLES, PAGE_SIZE};
use pciemu_proxy_protocol::ProxyRequest;

use crate::addr::{in_bounds, AddressMask};
use crate::descriptor::{DescriptorHeader, PageWalk, TransferDescriptor, TransferMode};
use crate::gate::StagedSync;
use crate::{lock, DmaError, GuestMemory, RequestQueue, GUEST_ERROR};

/// Engine status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DmaStatus {
    Idle = 0,
    Executing = 1,
    /// Terminal state entered by [`DmaEngine::fini`].
    Off = 2,
}

impl DmaStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Executing,
            _ => Self::Off,
        }
    }
}

/// Everything the engine needs from the device that owns it.
#[derive(Clone)]
pub struct EngineContext {
    pub memory: Arc<dyn GuestMemory>,
    pub queue: Arc<RequestQueue>,
}

/// Result of ringing the doorbell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Doorbell {
    /// Another transfer is in flight; the ring was dropped.
    Busy,
    Completed(TransferReport),
}

/// What a single `execute()` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub mode: TransferMode,
    /// Bytes accounted to each page, in handle order.
    pub page_bytes: Vec<u64>,
    pub syncs_queued: usize,
    /// Bytes left over when the descriptor ran out of pages.
    pub truncated: u64,
}

impl TransferReport {
    fn new(mode: TransferMode) -> Self {
        Self {
            mode,
            page_bytes: Vec::new(),
            syncs_queued: 0,
            truncated: 0,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.page_bytes.iter().sum()
    }
}

/// Doorbell-driven DMA engine with a device-resident window.
pub struct DmaEngine {
    status: AtomicU8,
    /// Address capability width, installed once by `init()`.
    mask_bits: AtomicU32,
    descriptor: Mutex<TransferDescriptor>,
    window: Mutex<Box<[u8]>>,
    /// Number of leading window bytes holding data of the last transfer or sync.
    filled: AtomicUsize,
    ctx: EngineContext,
}

impl DmaEngine {
    /// Create an initialized engine.
    pub fn new(ctx: EngineContext) -> Self {
        let engine = Self {
            status: AtomicU8::new(DmaStatus::Idle as u8),
            mask_bits: AtomicU32::new(0),
            descriptor: Mutex::new(TransferDescriptor::new()),
            window: Mutex::new(vec![0u8; DMA_AREA_SIZE as usize].into_boxed_slice()),
            filled: AtomicUsize::new(0),
            ctx,
        };
        engine.init();
        engine
    }

    pub fn status(&self) -> DmaStatus {
        DmaStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn mask(&self) -> AddressMask {
        AddressMask::new(self.mask_bits.load(Ordering::Relaxed))
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.ctx.queue
    }

    pub fn header(&self) -> DescriptorHeader {
        lock(&self.descriptor).header()
    }

    pub fn with_descriptor<R>(&self, f: impl FnOnce(&TransferDescriptor) -> R) -> R {
        f(&lock(&self.descriptor))
    }

    pub fn window_snapshot(&self) -> Vec<u8> {
        lock(&self.window).to_vec()
    }

    pub fn filled_len(&self) -> usize {
        self.filled.load(Ordering::Acquire)
    }

    /// Apply `update` to the descriptor if the engine is idle.
    ///
    /// The status is sampled while holding the descriptor lock, which is also the lock the
    /// doorbell snapshots the descriptor under. A write that observes `Executing` is dropped.
    fn configure(
        &self,
        field: &'static str,
        update: impl FnOnce(&mut TransferDescriptor) -> Result<(), DmaError>,
    ) -> Result<(), DmaError> {
        let mut desc = lock(&self.descriptor);
        match self.status() {
            DmaStatus::Idle => update(&mut desc),
            DmaStatus::Executing => {
                tracing::debug!(field, "dropping DMA configuration write while executing");
                Ok(())
            }
            DmaStatus::Off => Err(DmaError::Retired),
        }
    }

    pub fn configure_npages(&self, npages: u64) -> Result<(), DmaError> {
        self.configure("npages", |desc| {
            if npages > DMA_MAX_HANDLES as u64 {
                tracing::warn!(target: GUEST_ERROR, npages, "page count exceeds handle table");
                return Err(DmaError::TooManyPages(npages));
            }
            desc.header_mut().npages = npages;
            Ok(())
        })
    }

    pub fn configure_offset(&self, offset: u64) -> Result<(), DmaError> {
        self.configure("offset", |desc| {
            desc.header_mut().offset = offset;
            Ok(())
        })
    }

    pub fn configure_length(&self, length: u64) -> Result<(), DmaError> {
        self.configure("length", |desc| {
            desc.header_mut().length = length;
            Ok(())
        })
    }

    /// Store the raw mode register. Unknown modes are only rejected when executing.
    pub fn configure_mode(&self, mode: u64) -> Result<(), DmaError> {
        self.configure("mode", |desc| {
            desc.header_mut().mode = mode;
            Ok(())
        })
    }

    pub fn configure_handle(&self, index: usize, addr: u64) -> Result<(), DmaError> {
        self.configure("handle", |desc| {
            desc.set_handle(index, addr).inspect_err(|_| {
                tracing::warn!(target: GUEST_ERROR, index, "page handle outside work area");
            })
        })
    }

    /// Start a transfer.
    ///
    /// Only the `Idle -> Executing` transition admits a transfer, so at most one `execute()` runs
    /// per engine. The transfer runs synchronously on the caller's thread.
    pub fn ring_doorbell(&self) -> Result<Doorbell, DmaError> {
        match self.status.compare_exchange(
            DmaStatus::Idle as u8,
            DmaStatus::Executing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(prev) if DmaStatus::from_u8(prev) == DmaStatus::Executing => {
                tracing::debug!("doorbell rung while executing; ignored");
                return Ok(Doorbell::Busy);
            }
            Err(_) => return Err(DmaError::Retired),
        }

        let result = self.execute();

        // A hard reset or fini during the transfer already moved the status on.
        let _ = self.status.compare_exchange(
            DmaStatus::Executing as u8,
            DmaStatus::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        result.map(Doorbell::Completed)
    }

    fn execute(&self) -> Result<TransferReport, DmaError> {
        let (header, handles) = {
            let desc = lock(&self.descriptor);
            (desc.header(), desc.active_handles().to_vec())
        };

        if header.npages == 0 || header.length == 0 {
            tracing::warn!(
                target: GUEST_ERROR,
                npages = header.npages,
                length = header.length,
                "empty transfer descriptor"
            );
            return Err(DmaError::EmptyDescriptor {
                npages: header.npages,
                length: header.length,
            });
        }
        let Some(mode) = header.mode() else {
            tracing::warn!(target: GUEST_ERROR, mode = header.mode, "invalid transfer mode");
            return Err(DmaError::InvalidMode(header.mode));
        };
        if header.offset >= PAGE_SIZE {
            tracing::warn!(target: GUEST_ERROR, offset = header.offset, "offset outside first page");
            return Err(DmaError::OffsetOutOfPage {
                offset: header.offset,
            });
        }

        match mode {
            TransferMode::Work => self.execute_work(&header, &handles),
            TransferMode::Watch => Ok(self.execute_watch(&header, &handles)),
        }
    }

    /// Host pages -> device window, announcing each page to the peer.
    fn execute_work(
        &self,
        header: &DescriptorHeader,
        handles: &[u64],
    ) -> Result<TransferReport, DmaError> {
        let fits = DMA_AREA_START
            .checked_add(header.length)
            .is_some_and(in_bounds);
        if !fits {
            tracing::warn!(
                target: GUEST_ERROR,
                length = header.length,
                "transfer does not fit the device window"
            );
            return Err(DmaError::WindowOverflow {
                length: header.length,
            });
        }

        let mask = self.mask();
        let mut report = TransferReport::new(TransferMode::Work);
        let mut cursor = 0usize;
        self.filled.store(0, Ordering::Release);

        let mut walk = PageWalk::new(header.offset, header.length, handles.len());
        for span in walk.by_ref() {
            let src = mask.apply(handles[span.index]) + span.page_offset;
            let len = span.len as usize;
            {
                let mut window = lock(&self.window);
                self.ctx
                    .memory
                    .read_physical(src, &mut window[cursor..cursor + len])
                    .inspect_err(|err| {
                        tracing::warn!(target: GUEST_ERROR, page = span.index, "{err}");
                    })?;
            }
            cursor += len;
            self.filled.store(cursor, Ordering::Release);
            report.page_bytes.push(span.len);

            self.ctx.queue.push(ProxyRequest::Sync);
            report.syncs_queued += 1;
            tracing::trace!(page = span.index, src, len, "page copied into window");
        }

        report.truncated = walk.remaining();
        if report.truncated > 0 {
            tracing::warn!(
                target: GUEST_ERROR,
                remaining = report.truncated,
                "descriptor ran out of pages before the transfer length"
            );
        }
        Ok(report)
    }

    /// Device window -> pages described for the peer.
    ///
    /// Nothing is pulled here: the bytes are delivered by the peer through `Sync` and merged
    /// via the sync gate. The walk only accounts for the slots.
    fn execute_watch(&self, header: &DescriptorHeader, handles: &[u64]) -> TransferReport {
        let mask = self.mask();
        let mut report = TransferReport::new(TransferMode::Watch);
        let mut walk = PageWalk::new(header.offset, header.length, handles.len());
        for span in walk.by_ref() {
            tracing::trace!(
                slot = span.index,
                dst = mask.apply(handles[span.index]) + span.page_offset,
                len = span.len,
                "watch slot awaiting peer data"
            );
            report.page_bytes.push(span.len);
        }
        report.truncated = walk.remaining();
        report
    }

    /// Bytes a `Sync` sends to the peer: the filled part of the window.
    pub fn sync_payload(&self) -> Vec<u8> {
        let window = lock(&self.window);
        let n = self.filled.load(Ordering::Acquire).min(window.len());
        window[..n].to_vec()
    }

    /// Merge a payload received from the peer into the window.
    ///
    /// The descriptor takes the staged page count, offset and length; the local mode and page
    /// handles stay as the guest configured them. Refused while a transfer is executing.
    pub fn apply_sync(&self, staged: &StagedSync) -> Result<usize, DmaError> {
        let mut desc = lock(&self.descriptor);
        match self.status() {
            DmaStatus::Idle => {}
            DmaStatus::Executing => return Err(DmaError::Busy),
            DmaStatus::Off => return Err(DmaError::Retired),
        }

        let mut window = lock(&self.window);
        let len = staged.data.len().min(window.len());
        if len < staged.data.len() {
            tracing::warn!(
                received = staged.data.len(),
                kept = len,
                "synced buffer larger than the device window"
            );
        }
        window[..len].copy_from_slice(&staged.data[..len]);

        let header = desc.header_mut();
        header.npages = staged.descriptor.npages;
        header.offset = staged.descriptor.offset;
        header.length = len as u64;
        self.filled.store(len, Ordering::Release);
        Ok(len)
    }

    /// Hard reset.
    ///
    /// Does not wait for an in-flight transfer; a concurrently running `execute()` may keep
    /// writing pages into the freshly cleared window. A retired engine stays `Off`.
    pub fn reset(&self) {
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (DmaStatus::from_u8(s) != DmaStatus::Off).then_some(DmaStatus::Idle as u8)
            });
        lock(&self.descriptor).clear();
        lock(&self.window).fill(0);
        self.filled.store(0, Ordering::Release);
    }

    pub fn init(&self) {
        self.reset();
        self.mask_bits.store(DMA_ADDR_CAPABILITY, Ordering::Relaxed);
    }

    pub fn fini(&self) {
        self.reset();
        self.status.store(DmaStatus::Off as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for DmaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaEngine")
            .field("status", &self.status())
            .field("header", &self.header())
            .field("filled", &self.filled_len())
            .finish_non_exhaustive()
    }
}
