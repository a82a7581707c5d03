use std::net::SocketAddr;
use std::sync::Arc;

use pciemu_dma::{
    Doorbell, DmaEngine, DmaError, DmaStatus, EngineContext, GuestMemory, ProxyRequest,
    RequestQueue, TransferMode, GUEST_ERROR,
};
use pciemu_hw::{bar0, IRQ_FINI};
use pciemu_proxy::{LinkConfig, LinkContext, LinkHandle};

use crate::context::DeviceContext;
use crate::irq::InterruptSink;
use crate::mmio::{Access, MmioHandler};
use crate::DeviceError;

/// What one [`PciEmuDevice::poll`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub reset: bool,
    /// Bytes of a staged peer payload merged into the window.
    pub applied: Option<usize>,
    pub irq_raised: bool,
}

pub struct PciEmuDevice {
    regs: [u64; bar0::REG_COUNT],
    engine: Arc<DmaEngine>,
    ctx: Arc<DeviceContext>,
    link: Option<LinkHandle>,
    realized: bool,
}

impl PciEmuDevice {
    pub fn new(memory: Arc<dyn GuestMemory>, sink: Arc<dyn InterruptSink>) -> Self {
        let engine = DmaEngine::new(EngineContext {
            memory,
            queue: Arc::new(RequestQueue::new()),
        });
        Self {
            regs: [0; bar0::REG_COUNT],
            engine: Arc::new(engine),
            ctx: Arc::new(DeviceContext::new(sink)),
            link: None,
            realized: false,
        }
    }

    pub fn engine(&self) -> &Arc<DmaEngine> {
        &self.engine
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        self.engine.queue()
    }

    pub fn link(&self) -> Option<&LinkHandle> {
        self.link.as_ref()
    }

    pub fn is_realized(&self) -> bool {
        self.realized
    }

    pub fn realize(&mut self) -> Result<(), DeviceError> {
        if self.engine.status() == DmaStatus::Off {
            return Err(DeviceError::Retired);
        }
        self.engine.init();
        self.realized = true;
        tracing::info!("pciemu device realized");
        Ok(())
    }

    /// Retire the engine, close the sync gate and shut down the proxy link.
    ///
    /// Requests still queued for the peer are dropped. The link thread is joined, so its listener
    /// is released when this returns.
    pub fn unrealize(&mut self) {
        self.engine.fini();
        self.ctx.gate().close();
        self.ctx.irq().lower_all();
        self.queue().clear();
        if let Some(link) = self.link.take() {
            link.shutdown();
            match link.join() {
                Ok(outcome) => tracing::debug!(?outcome, "proxy link stopped"),
                Err(err) => tracing::warn!("proxy link ended with an error: {err}"),
            }
        }
        self.realized = false;
        tracing::info!("pciemu device unrealized");
    }

    /// Device reset: registers, interrupt state and DMA engine.
    pub fn reset(&mut self) {
        self.regs = [0; bar0::REG_COUNT];
        self.ctx.irq().lower_all();
        self.engine.reset();
        tracing::debug!("pciemu device reset");
    }

    /// Run work the proxy link deferred to the device's own thread.
    ///
    /// A scheduled reset runs first. A staged payload is merged only while no transfer is
    /// executing. A completion notice from the peer raises `IRQ_FINI` once the payload that came
    /// before it has been merged.
    pub fn poll(&mut self) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        if self.ctx.take_reset() {
            self.reset();
            outcome.reset = true;
        }

        let notify = self.ctx.take_notify();
        match self.ctx.gate().apply_to(&self.engine) {
            Ok(Some(len)) => {
                self.ctx.set_completed_len(len as u64);
                outcome.applied = Some(len);
            }
            Ok(None) => {}
            Err(err) => tracing::warn!("dropping synced payload: {err}"),
        }

        if notify {
            if self.ctx.gate().is_full() {
                self.ctx.defer_notify();
            } else {
                self.ctx.irq().raise(IRQ_FINI);
                outcome.irq_raised = true;
            }
        }
        outcome
    }

    /// Start a proxy link in the role `config` names.
    pub fn attach_proxy(&mut self, config: &LinkConfig) -> Result<SocketAddr, DeviceError> {
        if self.engine.status() == DmaStatus::Off {
            return Err(DeviceError::Retired);
        }
        if self.link.as_ref().is_some_and(|link| !link.is_finished()) {
            return Err(DeviceError::AlreadyAttached);
        }
        let ctx = LinkContext {
            engine: Arc::clone(&self.engine),
            gate: Arc::clone(self.ctx.gate()),
            hooks: self.ctx.clone(),
        };
        let link = pciemu_proxy::spawn(config, ctx)?;
        let addr = link.local_addr();
        self.link = Some(link);
        Ok(addr)
    }

    /// [`PciEmuDevice::attach_proxy`] with the configuration read from `PCIEMU_PROXY_*`.
    pub fn attach_proxy_from_env(&mut self) -> Result<SocketAddr, DeviceError> {
        let config = LinkConfig::from_env()?;
        self.attach_proxy(&config)
    }

    /// Hand back the link so the caller can join it.
    pub fn detach_proxy(&mut self) -> Option<LinkHandle> {
        self.link.take()
    }

    pub fn request(&self, req: ProxyRequest) {
        self.queue().push(req);
    }

    pub fn request_peer_sync(&self) {
        self.request(ProxyRequest::SyncRequestToPeer);
    }

    fn read_reg(&self, reg: u64) -> u64 {
        match reg {
            bar0::REG_0 | bar0::REG_1 | bar0::REG_2 | bar0::REG_3 => self.regs[(reg / 8) as usize],
            bar0::IRQ_0_RAISE | bar0::IRQ_0_LOWER => u64::from(self.ctx.irq().asserted()),
            bar0::DMA_CFG_LEN => self.engine.header().length,
            bar0::DMA_CFG_PGS => self.engine.header().npages,
            bar0::DMA_CFG_MODE => self.engine.header().mode,
            bar0::DMA_CFG_OFS => self.engine.header().offset,
            bar0::DMA_DOORBELL_RING => self.engine.status() as u64,
            _ => match handle_index(reg) {
                Some(index) => self
                    .engine
                    .with_descriptor(|d| d.handle(index))
                    .unwrap_or(0),
                None => 0,
            },
        }
    }

    fn write_reg(&mut self, reg: u64, value: u64) {
        let result = match reg {
            bar0::REG_0 | bar0::REG_1 | bar0::REG_2 | bar0::REG_3 => {
                self.regs[(reg / 8) as usize] = value;
                Ok(())
            }
            bar0::DMA_CFG_LEN => self.engine.configure_length(value),
            bar0::DMA_CFG_PGS => self.engine.configure_npages(value),
            bar0::DMA_CFG_MODE => self.engine.configure_mode(value),
            bar0::DMA_CFG_OFS => self.engine.configure_offset(value),
            _ => match handle_index(reg) {
                Some(index) => self.engine.configure_handle(index, value),
                None => Ok(()),
            },
        };
        if let Err(err) = result {
            tracing::debug!(reg, "register write rejected: {err}");
        }
    }

    fn ring_doorbell(&mut self) {
        match self.engine.ring_doorbell() {
            Ok(Doorbell::Completed(report)) => {
                tracing::debug!(
                    mode = ?report.mode,
                    bytes = report.bytes(),
                    syncs = report.syncs_queued,
                    "transfer finished"
                );
                // Queued behind the page Syncs, so the peer sees it after the data.
                if report.mode == TransferMode::Work && report.syncs_queued > 0 {
                    self.request(ProxyRequest::InterruptNotify);
                }
            }
            Ok(Doorbell::Busy) => {}
            Err(DmaError::Retired) => {
                tracing::debug!("doorbell on a retired engine");
            }
            Err(err) => tracing::debug!("transfer failed: {err}"),
        }
    }
}

fn handle_index(reg: u64) -> Option<usize> {
    (bar0::DMA_WORK_AREA_START..bar0::END)
        .contains(&reg)
        .then(|| ((reg - bar0::DMA_WORK_AREA_START) / 8) as usize)
}

impl MmioHandler for PciEmuDevice {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        let Some(access) = Access::decode(offset, size) else {
            tracing::warn!(target: GUEST_ERROR, offset, size, "invalid BAR0 read");
            return 0;
        };
        access.extract(self.read_reg(access.reg))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        let Some(access) = Access::decode(offset, size) else {
            tracing::warn!(target: GUEST_ERROR, offset, size, "invalid BAR0 write");
            return;
        };
        match access.reg {
            bar0::IRQ_0_RAISE | bar0::IRQ_0_LOWER => {
                let Ok(vector) = u32::try_from(access.command(value)) else {
                    tracing::warn!(target: GUEST_ERROR, value, "interrupt vector out of range");
                    return;
                };
                if access.reg == bar0::IRQ_0_RAISE {
                    self.ctx.irq().raise(vector);
                } else {
                    self.ctx.irq().lower(vector);
                }
            }
            bar0::DMA_DOORBELL_RING => self.ring_doorbell(),
            reg => {
                let value = if access.is_full() {
                    value
                } else {
                    access.merge(self.read_reg(reg), value)
                };
                self.write_reg(reg, value);
            }
        }
    }
}

impl std::fmt::Debug for PciEmuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PciEmuDevice")
            .field("realized", &self.realized)
            .field("engine", &self.engine)
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}
