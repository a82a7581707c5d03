use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pciemu_dma::{
    DmaEngine, EngineContext, FlatMemory, GuestMemory, RequestQueue, StagedSync, SyncGate,
    TransferMode,
};
use pciemu_hw::{DMA_AREA_SIZE, PAGE_SIZE};
use pciemu_proxy::{
    spawn_client, spawn_server, LinkConfig, LinkContext, LinkHooks, LinkOutcome, ProxyError,
};
use pciemu_proxy_protocol::{
    read_len, read_request, write_len, write_payload, write_request, ProxyRequest,
};

#[derive(Default)]
struct TestHooks {
    resets: AtomicUsize,
    irqs: AtomicUsize,
}

impl LinkHooks for TestHooks {
    fn schedule_reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn raise_completion_irq(&self) {
        self.irqs.fetch_add(1, Ordering::SeqCst);
    }
}

struct Peer {
    ctx: LinkContext,
    memory: Arc<FlatMemory>,
    queue: Arc<RequestQueue>,
    hooks: Arc<TestHooks>,
}

fn peer() -> Peer {
    let memory = Arc::new(FlatMemory::new(0x10_0000));
    let queue = Arc::new(RequestQueue::new());
    let hooks = Arc::new(TestHooks::default());
    let engine = Arc::new(DmaEngine::new(EngineContext {
        memory: memory.clone(),
        queue: queue.clone(),
    }));
    Peer {
        ctx: LinkContext {
            engine,
            gate: Arc::new(SyncGate::new()),
            hooks: hooks.clone(),
        },
        memory,
        queue,
        hooks,
    }
}

fn local_server() -> LinkConfig {
    LinkConfig::server("127.0.0.1", 0).with_poll_interval(Duration::from_millis(2))
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Run a work transfer of `data` on `peer`'s engine, leaving one `Sync` per page queued.
fn load_window(peer: &Peer, data: &[u8]) {
    let npages = (data.len() as u64).div_ceil(PAGE_SIZE);
    peer.memory.write_physical(0x1000, data).unwrap();
    let engine = &peer.ctx.engine;
    engine.configure_mode(TransferMode::Work.raw()).unwrap();
    engine.configure_npages(npages).unwrap();
    engine.configure_offset(0).unwrap();
    engine.configure_length(data.len() as u64).unwrap();
    for i in 0..npages {
        engine
            .configure_handle(i as usize, 0x1000 + i * PAGE_SIZE)
            .unwrap();
    }
    engine.ring_doorbell().unwrap();
}

#[test]
fn handled_requests_over_tcp() {
    let server = peer();
    let handle = spawn_server(&local_server(), server.ctx.clone()).unwrap();
    let mut raw = TcpStream::connect(handle.local_addr()).unwrap();

    write_request(&mut raw, ProxyRequest::Ping).unwrap();
    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::Pong);

    write_request(&mut raw, ProxyRequest::Reset).unwrap();
    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::Ack);
    write_request(&mut raw, ProxyRequest::InterruptNotify).unwrap();
    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::Ack);
    assert_eq!(server.hooks.resets.load(Ordering::SeqCst), 1);
    assert_eq!(server.hooks.irqs.load(Ordering::SeqCst), 1);

    raw.write_all(&0x99u32.to_le_bytes()).unwrap();
    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::Unrecognized);
    write_request(&mut raw, ProxyRequest::Ping).unwrap();
    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::Pong);

    drop(raw);
    assert_eq!(handle.join().unwrap(), LinkOutcome::Disconnected);
}

#[test]
fn server_accepts_again_after_quit() {
    let server = peer();
    let handle = spawn_server(&local_server(), server.ctx.clone()).unwrap();

    let mut first = TcpStream::connect(handle.local_addr()).unwrap();
    write_request(&mut first, ProxyRequest::Quit).unwrap();
    assert_eq!(read_request(&mut first).unwrap(), ProxyRequest::Ack);

    let mut second = TcpStream::connect(handle.local_addr()).unwrap();
    write_request(&mut second, ProxyRequest::Ping).unwrap();
    assert_eq!(read_request(&mut second).unwrap(), ProxyRequest::Pong);

    drop(second);
    assert_eq!(handle.join().unwrap(), LinkOutcome::Disconnected);
}

#[test]
fn issued_ping_and_quit_complete() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = peer();
    let config = LinkConfig::client("127.0.0.1", port).with_poll_interval(Duration::from_millis(2));
    let handle = spawn_client(&config, client.ctx.clone()).unwrap();
    let (mut raw, _) = listener.accept().unwrap();

    client.queue.push(ProxyRequest::Ping);
    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::Ping);
    write_request(&mut raw, ProxyRequest::Pong).unwrap();

    client.queue.push(ProxyRequest::Quit);
    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::Quit);
    write_request(&mut raw, ProxyRequest::Ack).unwrap();

    assert_eq!(handle.join().unwrap(), LinkOutcome::Quit);
}

#[test]
fn wrong_reply_to_ping_fails_the_link() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = peer();
    let handle = spawn_client(&LinkConfig::client("127.0.0.1", port), client.ctx.clone()).unwrap();
    let (mut raw, _) = listener.accept().unwrap();

    client.queue.push(ProxyRequest::Ping);
    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::Ping);
    write_request(&mut raw, ProxyRequest::Ack).unwrap();

    match handle.join() {
        Err(ProxyError::UnexpectedReply { expected, got }) => {
            assert_eq!(expected, ProxyRequest::Pong);
            assert_eq!(got, ProxyRequest::Ack);
        }
        other => panic!("expected UnexpectedReply, got {other:?}"),
    }
}

#[test]
fn issued_sync_carries_exactly_the_window_bytes() {
    let sender = peer();
    let data: Vec<u8> = (0..3000u32).map(|i| (i * 7) as u8).collect();
    load_window(&sender, &data);
    assert_eq!(sender.queue.pending(), vec![ProxyRequest::Sync]);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = spawn_client(&LinkConfig::client("127.0.0.1", port), sender.ctx.clone()).unwrap();
    let (mut raw, _) = listener.accept().unwrap();

    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::Sync);
    let len = read_len(&mut raw).unwrap();
    assert_eq!(len, data.len() as u64);
    let mut received = vec![0u8; len as usize];
    raw.read_exact(&mut received).unwrap();
    assert_eq!(received, data);
    write_request(&mut raw, ProxyRequest::Ack).unwrap();

    drop(raw);
    assert_eq!(handle.join().unwrap(), LinkOutcome::Disconnected);
}

#[test]
fn linked_peers_exchange_payloads_both_ways() {
    let a = peer();
    let b = peer();
    let server = spawn_server(&local_server(), a.ctx.clone()).unwrap();
    let config = LinkConfig::client("127.0.0.1", server.local_addr().port())
        .with_poll_interval(Duration::from_millis(2));
    let client = spawn_client(&config, b.ctx.clone()).unwrap();

    // a -> b through a queued Sync.
    let data = vec![0x5au8; 2 * PAGE_SIZE as usize];
    load_window(&a, &data);
    // The first Sync may go out while the second page is still being copied.
    wait_until("first payload at b", || b.ctx.gate.is_full());
    assert!(matches!(b.ctx.gate.apply_to(&b.ctx.engine), Ok(Some(_))));
    wait_until("second payload at b", || b.ctx.gate.is_full());
    assert_eq!(b.ctx.gate.apply_to(&b.ctx.engine), Ok(Some(data.len())));
    assert_eq!(b.ctx.engine.sync_payload(), data);
    wait_until("a's queue to drain", || a.queue.is_empty());

    // b pulls from a after a's window changes.
    let fresh = vec![0xc3u8; 100];
    a.ctx
        .engine
        .apply_sync(&StagedSync::from_payload(fresh.clone()))
        .unwrap();
    b.queue.push(ProxyRequest::SyncRequestToPeer);
    wait_until("pulled payload at b", || b.ctx.gate.is_full());
    assert_eq!(b.ctx.gate.take().unwrap().data, fresh);

    b.queue.push(ProxyRequest::Quit);
    assert_eq!(client.join().unwrap(), LinkOutcome::Quit);
    drop(server);
}

#[test]
fn oversized_payload_closes_the_connection() {
    let server = peer();
    let handle = spawn_server(&local_server(), server.ctx.clone()).unwrap();
    let mut raw = TcpStream::connect(handle.local_addr()).unwrap();

    write_request(&mut raw, ProxyRequest::Sync).unwrap();
    write_len(&mut raw, DMA_AREA_SIZE + 1).unwrap();
    raw.flush().unwrap();

    match handle.join() {
        Err(ProxyError::PayloadTooLarge { len, max }) => {
            assert_eq!(len, DMA_AREA_SIZE + 1);
            assert_eq!(max, DMA_AREA_SIZE);
        }
        other => panic!("expected PayloadTooLarge, got {other:?}"),
    }
    assert!(!server.ctx.gate.is_full());
}

#[test]
fn full_window_payload_is_accepted() {
    let server = peer();
    let handle = spawn_server(&local_server(), server.ctx.clone()).unwrap();
    let mut raw = TcpStream::connect(handle.local_addr()).unwrap();

    let payload = vec![0x11u8; DMA_AREA_SIZE as usize];
    write_request(&mut raw, ProxyRequest::Sync).unwrap();
    write_payload(&mut raw, &payload).unwrap();
    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::Ack);
    assert_eq!(server.ctx.gate.take().unwrap().data, payload);

    drop(raw);
    assert_eq!(handle.join().unwrap(), LinkOutcome::Disconnected);
}

#[test]
fn pull_answered_with_anything_but_sync_fails_the_link() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = peer();
    let handle = spawn_client(&LinkConfig::client("127.0.0.1", port), client.ctx.clone()).unwrap();
    let (mut raw, _) = listener.accept().unwrap();

    client.queue.push(ProxyRequest::SyncRequestToPeer);
    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::SyncRequestToPeer);
    write_request(&mut raw, ProxyRequest::Ack).unwrap();

    match handle.join() {
        Err(ProxyError::UnexpectedReply { expected, got }) => {
            assert_eq!(expected, ProxyRequest::Sync);
            assert_eq!(got, ProxyRequest::Ack);
        }
        other => panic!("expected UnexpectedReply, got {other:?}"),
    }
    assert!(!client.ctx.gate.is_full());
}

#[test]
fn unreachable_peer_fails_at_spawn() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = peer();
    match spawn_client(&LinkConfig::client("127.0.0.1", port), client.ctx.clone()) {
        Err(ProxyError::Io(_)) => {}
        other => panic!("expected a connect error, got {other:?}"),
    }
}

#[test]
fn shutdown_closes_the_connection_and_the_listener() {
    let server = peer();
    let handle = spawn_server(&local_server(), server.ctx.clone()).unwrap();
    let addr = handle.local_addr();
    let mut raw = TcpStream::connect(addr).unwrap();
    write_request(&mut raw, ProxyRequest::Ping).unwrap();
    assert_eq!(read_request(&mut raw).unwrap(), ProxyRequest::Pong);

    handle.shutdown();
    assert_eq!(handle.join().unwrap(), LinkOutcome::Shutdown);

    raw.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut rest = Vec::new();
    if let Err(err) = raw.read_to_end(&mut rest) {
        assert!(
            !matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            "connection still open: {err}"
        );
    }
    assert!(rest.is_empty());
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn idle_server_shuts_down() {
    let server = peer();
    let handle = spawn_server(&local_server(), server.ctx.clone()).unwrap();
    handle.shutdown();
    assert_eq!(handle.join().unwrap(), LinkOutcome::Shutdown);
}
