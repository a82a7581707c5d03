use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use pciemu_dma::{DmaEngine, StagedSync, SyncGate};
use pciemu_hw::DMA_AREA_SIZE;
use pciemu_proxy_protocol::{
    read_code, read_len, read_request, write_payload, write_request, ProxyRequest,
};

use crate::ProxyError;

/// Device-side effects of requests received from the peer.
///
/// Both run on the link thread and must only record the work; the device performs it from its own
/// poll context.
pub trait LinkHooks: Send + Sync {
    fn schedule_reset(&self);
    fn raise_completion_irq(&self);
}

/// What a link needs from its device.
#[derive(Clone)]
pub struct LinkContext {
    pub engine: Arc<DmaEngine>,
    pub gate: Arc<SyncGate>,
    pub hooks: Arc<dyn LinkHooks>,
}

/// Whether the connection loop continues after a handled or issued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// How a served connection ended without a protocol failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// A `Quit` exchange completed, in either direction.
    Quit,
    /// The peer closed the connection.
    Disconnected,
    /// The local side stopped the link through `LinkHandle::shutdown`.
    Shutdown,
}

/// One side of a connection: the request/reply exchanges over `stream`.
pub struct Session<S> {
    stream: S,
    ctx: LinkContext,
}

impl<S: Read + Write> Session<S> {
    pub fn new(stream: S, ctx: LinkContext) -> Self {
        Self { stream, ctx }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Answer a request code the peer sent.
    pub fn handle(&mut self, code: u32) -> Result<Flow, ProxyError> {
        let Some(req) = ProxyRequest::from_code(code) else {
            tracing::warn!(code, "unrecognized request from peer");
            write_request(&mut self.stream, ProxyRequest::Unrecognized)?;
            return Ok(Flow::Continue);
        };
        tracing::debug!(?req, "handling peer request");

        match req {
            ProxyRequest::Ping => write_request(&mut self.stream, ProxyRequest::Pong)?,
            ProxyRequest::Reset => {
                self.ctx.hooks.schedule_reset();
                write_request(&mut self.stream, ProxyRequest::Ack)?;
            }
            ProxyRequest::Quit => {
                write_request(&mut self.stream, ProxyRequest::Ack)?;
                return Ok(Flow::Quit);
            }
            ProxyRequest::InterruptNotify => {
                self.ctx.hooks.raise_completion_irq();
                write_request(&mut self.stream, ProxyRequest::Ack)?;
            }
            ProxyRequest::Sync => self.receive_sync()?,
            ProxyRequest::SyncRequestToPeer => {
                write_request(&mut self.stream, ProxyRequest::Sync)?;
                self.write_window()?;
                self.expect(ProxyRequest::Ack)?;
            }
            ProxyRequest::None
            | ProxyRequest::Ack
            | ProxyRequest::Pong
            | ProxyRequest::Unrecognized => {
                tracing::debug!(?req, "stray reply from peer ignored");
            }
        }
        Ok(Flow::Continue)
    }

    /// Send a queued request and wait for the matching reply.
    pub fn issue(&mut self, req: ProxyRequest) -> Result<Flow, ProxyError> {
        let Some(expected) = req.expected_reply() else {
            return Ok(Flow::Continue);
        };
        tracing::debug!(?req, "issuing request to peer");
        write_request(&mut self.stream, req)?;
        if req == ProxyRequest::Sync {
            self.write_window()?;
        }
        self.expect(expected)?;

        match req {
            ProxyRequest::SyncRequestToPeer => self.receive_sync()?,
            ProxyRequest::Quit => return Ok(Flow::Quit),
            _ => {}
        }
        Ok(Flow::Continue)
    }

    fn expect(&mut self, expected: ProxyRequest) -> Result<(), ProxyError> {
        let got = read_request(&mut self.stream)?;
        if got != expected {
            tracing::warn!(?expected, ?got, "unexpected reply from peer");
            return Err(ProxyError::UnexpectedReply { expected, got });
        }
        Ok(())
    }

    /// `len | payload` carrying the filled part of the engine window.
    fn write_window(&mut self) -> Result<(), ProxyError> {
        let payload = self.ctx.engine.sync_payload();
        write_payload(&mut self.stream, &payload)?;
        tracing::debug!(len = payload.len(), "payload sent to peer");
        Ok(())
    }

    /// Receive `len | payload`, stage it for the device, then `Ack`.
    fn receive_sync(&mut self) -> Result<(), ProxyError> {
        let len = read_len(&mut self.stream)?;
        if len > DMA_AREA_SIZE {
            tracing::warn!(len, "peer payload exceeds the device window");
            return Err(ProxyError::PayloadTooLarge {
                len,
                max: DMA_AREA_SIZE,
            });
        }
        // Bounded by the window size above.
        let len = len as usize;

        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| ProxyError::Allocation { len })?;
        data.resize(len, 0);
        self.stream.read_exact(&mut data)?;

        self.ctx.gate.stage(StagedSync::from_payload(data))?;
        write_request(&mut self.stream, ProxyRequest::Ack)?;
        tracing::debug!(len, "payload staged");
        Ok(())
    }
}

enum Inbound {
    Ready,
    Idle,
    Closed,
}

fn poll_inbound(stream: &TcpStream) -> io::Result<Inbound> {
    stream.set_nonblocking(true)?;
    let mut probe = [0u8; 1];
    let polled = stream.peek(&mut probe);
    stream.set_nonblocking(false)?;
    match polled {
        Ok(0) => Ok(Inbound::Closed),
        Ok(_) => Ok(Inbound::Ready),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Inbound::Idle),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(Inbound::Idle),
        Err(err) => Err(err),
    }
}

/// Run the link over `stream` until a `Quit` exchange, a disconnect, or a protocol failure.
///
/// Inbound requests take priority over queued ones. With neither pending the loop waits up to
/// `poll_interval` on the engine's request queue.
pub fn serve(
    stream: TcpStream,
    ctx: LinkContext,
    poll_interval: Duration,
) -> Result<LinkOutcome, ProxyError> {
    stream.set_nodelay(true)?;
    let queue = Arc::clone(ctx.engine.queue());
    let mut session = Session::new(stream, ctx);

    loop {
        match poll_inbound(session.stream())? {
            Inbound::Closed => {
                tracing::info!("peer closed the connection");
                return Ok(LinkOutcome::Disconnected);
            }
            Inbound::Ready => {
                let code = read_code(&mut session.stream)?;
                if session.handle(code)? == Flow::Quit {
                    tracing::info!("peer requested quit");
                    return Ok(LinkOutcome::Quit);
                }
                continue;
            }
            Inbound::Idle => {}
        }

        let req = match queue.pop() {
            ProxyRequest::None => queue.pop_timeout(poll_interval),
            req => req,
        };
        if session.issue(req)? == Flow::Quit {
            tracing::info!("quit acknowledged by peer");
            return Ok(LinkOutcome::Quit);
        }
    }
}
