// ABOUTME: Request/response correlation for one connection.
// ABOUTME: Allocates request ids, parks waiters, matches responses and expires stale entries.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::RpcError;
use crate::sync::lock;

/// Outcome delivered to a waiting caller.
pub type ResponseResult = Result<Bytes, RpcError>;

struct PendingRequest {
    tx: oneshot::Sender<ResponseResult>,
    enqueued_at: Instant,
}

struct PendingTable {
    next_id: u32,
    pending: HashMap<u32, PendingRequest>,
    /// Set once the owning connection is terminal; no new entries after that.
    terminated: bool,
}

impl PendingTable {
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Pending-request table owned by one connection.
///
/// Every entry is removed exactly once: by a matching response, by the
/// timeout sweep, by cancellation, or by [`Correlator::drain`].
#[derive(Clone)]
pub struct Correlator {
    table: Arc<Mutex<PendingTable>>,
    timeout: Duration,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self::starting_at(0, timeout)
    }

    fn starting_at(first_id: u32, timeout: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(PendingTable {
                next_id: first_id,
                pending: HashMap::new(),
                terminated: false,
            })),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Allocate an id and park a waiter for it.
    pub fn register(&self) -> Result<(u32, ResponseFuture), RpcError> {
        let mut table = lock(&self.table);
        if table.terminated {
            return Err(RpcError::ConnectionTerminated);
        }
        let id = table.allocate_id();
        let (tx, rx) = oneshot::channel();
        table.pending.insert(
            id,
            PendingRequest {
                tx,
                enqueued_at: Instant::now(),
            },
        );
        Ok((
            id,
            ResponseFuture {
                request_id: id,
                rx,
                table: Arc::downgrade(&self.table),
                finished: false,
            },
        ))
    }

    /// Deliver a response. Returns false for unknown (late or duplicate) ids.
    pub fn complete(&self, request_id: u32, result: ResponseResult) -> bool {
        let entry = lock(&self.table).pending.remove(&request_id);
        match entry {
            Some(pending) => {
                if pending.tx.send(result).is_err() {
                    tracing::debug!(request_id, "response receiver already dropped");
                }
                true
            }
            None => {
                tracing::debug!(request_id, "discarding response for unknown request");
                false
            }
        }
    }

    /// Remove a pending entry. No-op if it already completed.
    pub fn cancel(&self, request_id: u32) -> bool {
        let entry = lock(&self.table).pending.remove(&request_id);
        match entry {
            Some(pending) => {
                let _ = pending.tx.send(Err(RpcError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fail every entry older than the timeout. Returns how many expired.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(u32, PendingRequest)> = {
            let mut table = lock(&self.table);
            let ids: Vec<u32> = table
                .pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.enqueued_at) >= self.timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| table.pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = expired.len();
        for (request_id, pending) in expired {
            tracing::debug!(request_id, "request timed out");
            let _ = pending.tx.send(Err(RpcError::ResponseTimeout { request_id }));
        }
        count
    }

    /// Fail every entry with `ConnectionTerminated` and refuse new ones.
    pub fn drain(&self) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = lock(&self.table);
            table.terminated = true;
            table.pending.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.tx.send(Err(RpcError::ConnectionTerminated));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.table).pending.len()
    }
}

/// Handle to a parked request.
///
/// Resolves with the response payload or an error. Dropping it before it
/// resolves cancels the request and frees its id.
pub struct ResponseFuture {
    request_id: u32,
    rx: oneshot::Receiver<ResponseResult>,
    table: Weak<Mutex<PendingTable>>,
    finished: bool,
}

impl ResponseFuture {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("request_id", &self.request_id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Future for ResponseFuture {
    type Output = ResponseResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.finished = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.finished = true;
                Poll::Ready(Err(RpcError::ConnectionTerminated))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Closing first lets us recognise our own entry: only its sender sees
        // a closed receiver, even if the id has been reused since.
        self.rx.close();
        if let Some(table) = self.table.upgrade() {
            let mut table = lock(&table);
            if table
                .pending
                .get(&self.request_id)
                .is_some_and(|p| p.tx.is_closed())
            {
                table.pending.remove(&self.request_id);
            }
        }
    }
}
