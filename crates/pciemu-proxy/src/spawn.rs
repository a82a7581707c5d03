use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::link::{serve, LinkContext, LinkOutcome};
use crate::{LinkConfig, LinkRole, ProxyError};

/// How long `shutdown` waits when poking a server's own listener.
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Stop request shared between a [`LinkHandle`] and its thread.
#[derive(Debug, Default)]
struct Stopper {
    stopped: AtomicBool,
    /// Clone of the connection being served, so it can be shut down from outside.
    active: Mutex<Option<TcpStream>>,
}

impl Stopper {
    fn active(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Register `stream` as the served connection. Returns `false` if a stop already happened,
    /// in which case the caller must not serve it.
    fn track(&self, stream: &TcpStream) -> io::Result<bool> {
        *self.active() = Some(stream.try_clone()?);
        Ok(!self.is_stopped())
    }

    fn untrack(&self) {
        self.active().take();
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(stream) = self.active().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// A running link thread.
pub struct LinkHandle {
    role: LinkRole,
    addr: SocketAddr,
    stopper: Arc<Stopper>,
    thread: JoinHandle<Result<LinkOutcome, ProxyError>>,
}

impl LinkHandle {
    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Listening address for a server, local end of the connection for a client.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Close the served connection and, for a server, stop accepting.
    ///
    /// The thread then ends with [`LinkOutcome::Shutdown`]; the listener is released once it
    /// does.
    pub fn shutdown(&self) {
        self.stopper.stop();
        if self.role == LinkRole::Server {
            // Wake the blocked `accept`.
            let mut wake = self.addr;
            if wake.ip().is_unspecified() {
                wake.set_ip(match wake.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                });
            }
            if let Err(err) = TcpStream::connect_timeout(&wake, WAKE_TIMEOUT) {
                tracing::debug!(%wake, "failed to wake proxy listener: {err}");
            }
        }
        tracing::info!(role = %self.role, addr = %self.addr, "proxy link shut down");
    }

    /// Wait for the link to stop and return how the last connection ended.
    pub fn join(self) -> Result<LinkOutcome, ProxyError> {
        self.thread.join().map_err(|_| ProxyError::Panicked)?
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("role", &self.role)
            .field("addr", &self.addr)
            .field("stopped", &self.stopper.is_stopped())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Start the link in the role `config` asks for.
pub fn spawn(config: &LinkConfig, ctx: LinkContext) -> Result<LinkHandle, ProxyError> {
    match config.role {
        LinkRole::Server => spawn_server(config, ctx),
        LinkRole::Client => spawn_client(config, ctx),
    }
}

/// Bind and serve connections one at a time.
///
/// After a connection ends with `Quit` the next one is accepted; a disconnect, a protocol
/// failure or [`LinkHandle::shutdown`] stops the server.
pub fn spawn_server(config: &LinkConfig, ctx: LinkContext) -> Result<LinkHandle, ProxyError> {
    let listener = TcpListener::bind(config.endpoint())?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "proxy link listening");

    let stopper = Arc::new(Stopper::default());
    let poll_interval = config.poll_interval;
    let thread = {
        let stopper = Arc::clone(&stopper);
        thread::Builder::new()
            .name("pciemu-proxy-server".into())
            .spawn(move || accept_loop(listener, ctx, poll_interval, &stopper))?
    };

    Ok(LinkHandle {
        role: LinkRole::Server,
        addr,
        stopper,
        thread,
    })
}

fn accept_loop(
    listener: TcpListener,
    ctx: LinkContext,
    poll_interval: Duration,
    stopper: &Stopper,
) -> Result<LinkOutcome, ProxyError> {
    loop {
        if stopper.is_stopped() {
            return Ok(LinkOutcome::Shutdown);
        }
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(_) if stopper.is_stopped() => return Ok(LinkOutcome::Shutdown),
            Err(err) => return Err(err.into()),
        };
        if !stopper.track(&stream)? {
            return Ok(LinkOutcome::Shutdown);
        }
        tracing::info!(%peer, "proxy peer connected");

        let result = serve(stream, ctx.clone(), poll_interval);
        stopper.untrack();
        if stopper.is_stopped() {
            return Ok(LinkOutcome::Shutdown);
        }
        match result {
            Ok(LinkOutcome::Quit) => continue,
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                tracing::warn!(%peer, "proxy link failed: {err}");
                return Err(err);
            }
        }
    }
}

/// Connect to a listening peer and serve that single connection.
///
/// The connection is established before this returns, so an unreachable peer is reported here.
pub fn spawn_client(config: &LinkConfig, ctx: LinkContext) -> Result<LinkHandle, ProxyError> {
    let stream = TcpStream::connect(config.endpoint())?;
    let addr = stream.local_addr()?;
    tracing::info!(peer = %config.endpoint(), "proxy link connected");

    let stopper = Arc::new(Stopper::default());
    stopper.track(&stream)?;
    let poll_interval = config.poll_interval;
    let thread = {
        let stopper = Arc::clone(&stopper);
        thread::Builder::new()
            .name("pciemu-proxy-client".into())
            .spawn(move || {
                let result = serve(stream, ctx, poll_interval);
                stopper.untrack();
                if stopper.is_stopped() {
                    return Ok(LinkOutcome::Shutdown);
                }
                result.inspect_err(|err| tracing::warn!("proxy link failed: {err}"))
            })?
    };

    Ok(LinkHandle {
        role: LinkRole::Client,
        addr,
        stopper,
        thread,
    })
}
