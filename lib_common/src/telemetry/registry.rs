//! # Client Registry
//!
//! Tracks the live set of realtime subscribers. Membership sits behind a
//! read-many/write-one lock that is only ever held for map operations, never
//! across a socket write. Each member owns its outbound sink behind its own
//! async mutex, so a slow client only ever stalls writes to itself.
//!
//! A member that is still receiving its history replay does not take live
//! writes at all: they are queued on the handle and flushed by the attaching
//! task once the replay is done, so fan-out never waits on a replay.

use futures_util::{Sink, SinkExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

/// Identifier handed out by [`ClientRegistry::new_handle`].
pub type ClientId = usize;

/// Outbound half of a subscriber connection, carrying serialised JSON frames.
pub type ClientSink = Pin<Box<dyn Sink<String, Error = DeliveryError> + Send>>;

/// Why a write to a subscriber failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("websocket write failed: {0}")]
    Transport(#[from] axum::Error),
    #[error("client channel closed")]
    Closed,
    #[error("failed to encode reading: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The writable side of one client plus the sequence of the last reading it was
/// sent. Readings at or below that sequence are skipped, which keeps every
/// client's stream strictly ordered and free of duplicates.
pub struct Outbound {
    sink: ClientSink,
    last_seq: u64,
}

impl Outbound {
    /// Writes `payload` unless reading `seq` was already sent. Returns whether a
    /// frame actually went out.
    pub async fn write(&mut self, seq: u64, payload: String) -> Result<bool, DeliveryError> {
        if seq <= self.last_seq {
            return Ok(false);
        }
        self.sink.send(payload).await?;
        self.last_seq = seq;
        Ok(true)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}

/// Live frames held back while a client's history replay is in progress.
pub type PendingFrames = Vec<(u64, String)>;

/// A registered subscriber.
pub struct ClientHandle {
    id: ClientId,
    outbound: Mutex<Outbound>,
    /// `Some` while replaying; live frames collect here instead of being written.
    pending: StdMutex<Option<PendingFrames>>,
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Exclusive access to the client's sink.
    pub async fn outbound(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().await
    }

    /// Live delivery of reading `seq`. While the client is replaying the frame is
    /// queued and `Ok(false)` returned without touching the socket; otherwise it
    /// is written under the sink lock for the duration of that one write.
    pub async fn send(&self, seq: u64, payload: String) -> Result<bool, DeliveryError> {
        let payload = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.as_mut() {
                Some(queue) => {
                    queue.push((seq, payload));
                    return Ok(false);
                }
                None => payload,
            }
        };
        self.outbound.lock().await.write(seq, payload).await
    }

    pub fn is_replaying(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Takes the frames queued during replay. Once nothing is left the client
    /// switches to direct writes, in the same critical section, so no frame can
    /// slip between the last drain and going live.
    pub fn drain_pending(&self) -> PendingFrames {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = pending.as_mut() {
            if !queue.is_empty() {
                return std::mem::take(queue);
            }
        }
        *pending = None;
        Vec::new()
    }

    /// Best-effort close of the underlying connection. Skipped when a write
    /// holds the sink; the connection then closes when the handle is dropped.
    pub async fn close(&self) {
        match self.outbound.try_lock() {
            Ok(mut outbound) => {
                if let Err(e) = outbound.sink.close().await {
                    log::debug!("Client {} close failed: {}", self.id, e);
                }
            }
            Err(_) => log::debug!("Client {} sink busy, not closing explicitly", self.id),
        }
    }
}

/// The set of currently connected subscribers.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, Arc<ClientHandle>>>,
    next_id: AtomicUsize,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps `sink` in a handle with a fresh id that takes live writes directly.
    /// The handle is not registered yet.
    pub fn new_handle(&self, sink: ClientSink) -> Arc<ClientHandle> {
        self.build_handle(sink, None)
    }

    /// Like [`new_handle`](Self::new_handle), but live writes are queued until
    /// [`ClientHandle::drain_pending`] comes back empty.
    pub fn new_replaying_handle(&self, sink: ClientSink) -> Arc<ClientHandle> {
        self.build_handle(sink, Some(Vec::new()))
    }

    fn build_handle(&self, sink: ClientSink, pending: Option<PendingFrames>) -> Arc<ClientHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(ClientHandle {
            id,
            outbound: Mutex::new(Outbound { sink, last_seq: 0 }),
            pending: StdMutex::new(pending),
        })
    }

    pub fn register(&self, handle: Arc<ClientHandle>) {
        let id = handle.id();
        let count = {
            let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
            clients.insert(id, handle);
            clients.len()
        };
        log::info!("Client {} connected ({} active)", id, count);
    }

    /// Removes the client and closes its connection. Returns `false` if it was
    /// already gone.
    pub async fn unregister(&self, id: ClientId) -> bool {
        let removed = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        match removed {
            Some(handle) => {
                handle.close().await;
                log::info!("Client {} disconnected ({} active)", id, self.len());
                true
            }
            None => false,
        }
    }

    /// Handles of every member at this instant.
    pub fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
