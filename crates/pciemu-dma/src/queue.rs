use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use pciemu_proxy_protocol::ProxyRequest;

use crate::lock;

/// FIFO of requests the device wants the proxy link to issue to its peer.
///
/// The DMA engine (and the device owner) push; the link thread pops between polls of its socket.
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: Mutex<VecDeque<ProxyRequest>>,
    pushed: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, req: ProxyRequest) {
        lock(&self.entries).push_back(req);
        self.pushed.notify_one();
    }

    /// Remove the head of the queue, or [`ProxyRequest::None`] when it is empty.
    pub fn pop(&self) -> ProxyRequest {
        lock(&self.entries).pop_front().unwrap_or(ProxyRequest::None)
    }

    /// Like [`RequestQueue::pop`], but waits up to `timeout` for a request to show up.
    pub fn pop_timeout(&self, timeout: Duration) -> ProxyRequest {
        let entries = lock(&self.entries);
        let (mut entries, _) = self
            .pushed
            .wait_timeout_while(entries, timeout, |q| q.is_empty())
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.pop_front().unwrap_or(ProxyRequest::None)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Snapshot of the queued requests, head first.
    pub fn pending(&self) -> Vec<ProxyRequest> {
        lock(&self.entries).iter().copied().collect()
    }
}
