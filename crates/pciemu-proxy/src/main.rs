#![forbid(unsafe_code)]

//! Stand-alone proxy peer.
//!
//! Runs a link against a private DMA engine so a device's proxy can be poked by hand: each stdin
//! line queues one request for the peer.

use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use pciemu_dma::{DmaEngine, EngineContext, FlatMemory, ProxyRequest, RequestQueue, SyncGate};
use pciemu_proxy::{spawn, LinkConfig, LinkContext, LinkHooks, LinkRole};

/// Scratch memory behind the private engine.
const SCRATCH_MEMORY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Parser)]
#[command(
    name = "pciemu-proxy",
    version,
    about = "Talk to a pciemu device's proxy link from the terminal."
)]
struct Args {
    /// `server` to wait for the device, `client` to connect to it.
    ///
    /// Environment variable: `PCIEMU_PROXY_ROLE`.
    #[arg(long, env = "PCIEMU_PROXY_ROLE", default_value = "client")]
    role: String,

    /// Environment variable: `PCIEMU_PROXY_HOST`.
    #[arg(long, env = "PCIEMU_PROXY_HOST", default_value = pciemu_proxy::DEFAULT_HOST)]
    host: String,

    /// Environment variable: `PCIEMU_PROXY_PORT`.
    #[arg(long, env = "PCIEMU_PROXY_PORT", default_value_t = pciemu_proxy::DEFAULT_PORT)]
    port: u16,

    /// Idle wait between socket polls, in milliseconds.
    ///
    /// Environment variable: `PCIEMU_PROXY_POLL_MS`.
    #[arg(long, env = "PCIEMU_PROXY_POLL_MS", default_value_t = 10)]
    poll_ms: u64,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `PCIEMU_PROXY_LOG`.
    #[arg(long, env = "PCIEMU_PROXY_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn link_config(&self) -> anyhow::Result<LinkConfig> {
        let Ok(role) = self.role.parse::<LinkRole>() else {
            bail!("unknown role {:?} (expected server or client)", self.role);
        };
        if self.poll_ms == 0 {
            bail!("--poll-ms must be positive");
        }
        Ok(LinkConfig {
            role,
            host: self.host.clone(),
            port: self.port,
            poll_interval: Duration::from_millis(self.poll_ms),
        })
    }
}

/// The peer has no guest: resets apply immediately and interrupts are only reported.
struct PeerHooks {
    engine: Arc<DmaEngine>,
}

impl LinkHooks for PeerHooks {
    fn schedule_reset(&self) {
        tracing::info!("reset requested by device");
        self.engine.reset();
    }

    fn raise_completion_irq(&self) {
        tracing::info!("completion interrupt raised by device");
    }
}

fn parse_command(line: &str) -> Option<ProxyRequest> {
    Some(match line.trim().to_ascii_lowercase().as_str() {
        "ping" => ProxyRequest::Ping,
        "reset" => ProxyRequest::Reset,
        "irq" => ProxyRequest::InterruptNotify,
        "sync" => ProxyRequest::Sync,
        "pull" => ProxyRequest::SyncRequestToPeer,
        "quit" => ProxyRequest::Quit,
        _ => return None,
    })
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.link_config()?;

    let queue = Arc::new(RequestQueue::new());
    let engine = Arc::new(DmaEngine::new(EngineContext {
        memory: Arc::new(FlatMemory::new(SCRATCH_MEMORY_BYTES)),
        queue: queue.clone(),
    }));
    let gate = Arc::new(SyncGate::new());
    let ctx = LinkContext {
        engine: engine.clone(),
        gate: gate.clone(),
        hooks: Arc::new(PeerHooks {
            engine: engine.clone(),
        }),
    };

    let link = spawn(&config, ctx)
        .with_context(|| format!("failed to start {} link on {}", config.role, config.endpoint()))?;
    tracing::info!(role = %link.role(), addr = %link.local_addr(), "pciemu-proxy ready");

    {
        let engine = engine.clone();
        let gate = gate.clone();
        let poll = config.poll_interval;
        thread::Builder::new()
            .name("pciemu-proxy-apply".into())
            .spawn(move || loop {
                if gate.is_closed() {
                    return;
                }
                match gate.apply_to(&engine) {
                    Ok(Some(len)) => tracing::info!(len, "payload received from device"),
                    Ok(None) => thread::sleep(poll),
                    Err(err) => {
                        tracing::warn!("dropping payload: {err}");
                        return;
                    }
                }
            })
            .context("failed to spawn apply thread")?;
    }

    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        if link.is_finished() {
            tracing::warn!("link is down; ignoring {line:?}");
            break;
        }
        let Some(req) = parse_command(&line) else {
            tracing::warn!("unknown command {line:?} (ping, reset, irq, sync, pull, quit)");
            continue;
        };
        queue.push(req);
        if req == ProxyRequest::Quit {
            break;
        }
    }

    if link.role() == LinkRole::Client {
        let outcome = link.join().context("proxy link failed")?;
        tracing::info!(?outcome, "link closed");
    }
    gate.close();
    Ok(())
}
