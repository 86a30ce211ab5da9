//! Full-duplex, id-multiplexed messaging with one worker process.
//!
//! A mailbox owns both pipe halves of one child. Writes are serialized
//! behind an async lock; a single background demultiplexer task owns the
//! read half and routes every arriving frame to the slot registered for
//! its id. The readable signal tells the pool that *some* frame has
//! arrived, and hence that the worker can already be handed to the next
//! client, before the payload is decoded and delivered.

use crate::codec::{self, Frame, SENTINEL};
use crate::errors::PoolError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a mailbox stopped.
#[derive(Clone, Debug, Eq, PartialEq)]
enum CloseReason {
    /// Orderly close from our side.
    Shutdown,
    /// Peer hung up (EOF) or the pipe failed.
    Died,
    /// A frame could not be decoded.
    Codec(String),
    /// A frame arrived for an id with no slot.
    Protocol(u64),
}

struct Shared {
    /// Sender halves, drained by the demultiplexer.
    slots: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    /// Receiver halves, drained by `recv`.
    pending: Mutex<HashMap<u64, oneshot::Receiver<Value>>>,
    /// Readable signal: one permit per arrived frame.
    arrived: Semaphore,
    closed: Mutex<Option<CloseReason>>,
}

impl Shared {
    /// Terminal error for operations on a closed mailbox.
    fn closed_error(&self) -> PoolError {
        match self.closed.lock().as_ref() {
            Some(CloseReason::Shutdown) => PoolError::PoolClosed,
            _ => PoolError::WorkerDied,
        }
    }

    /// Record the close reason; the first writer wins.
    fn set_reason(&self, reason: CloseReason) {
        let mut closed = self.closed.lock();
        if closed.is_none() {
            *closed = Some(reason);
        }
    }

    /// Record the close reason and wake everyone: undrained slots fail
    /// and parked `readable` calls error out.
    fn finalize(&self, reason: CloseReason) {
        self.set_reason(reason);
        self.slots.lock().clear();
        self.arrived.close();
    }
}

/// Id-multiplexed channel over one worker's pipe pair.
pub struct Mailbox {
    shared: Arc<Shared>,
    writer: AsyncMutex<Option<Writer>>,
    next_id: AtomicU64,
    demux: Mutex<Option<JoinHandle<()>>>,
}

impl Mailbox {
    /// Wrap a pipe pair and start the demultiplexer.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            slots: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            arrived: Semaphore::new(0),
            closed: Mutex::new(None),
        });

        let demux_shared = Arc::clone(&shared);
        let demux = tokio::spawn(async move {
            let reason = demultiplex(&demux_shared, Box::new(reader)).await;
            debug!("mailbox demultiplexer stopped: {:?}", reason);
            demux_shared.finalize(reason);
        });

        Mailbox {
            shared,
            writer: AsyncMutex::new(Some(Box::new(writer))),
            next_id: AtomicU64::new(0),
            demux: Mutex::new(Some(demux)),
        }
    }

    /// Assign an id, register its slot, and write one framed message.
    pub async fn send(&self, payload: Value) -> Result<u64, PoolError> {
        if self.is_closed() {
            return Err(self.shared.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.slots.lock().insert(id, tx);
        self.shared.pending.lock().insert(id, rx);

        if let Err(err) = self.write(id, payload).await {
            self.shared.slots.lock().remove(&id);
            self.shared.pending.lock().remove(&id);
            return Err(err);
        }
        trace!("sent frame id {}", id);
        Ok(id)
    }

    async fn write(&self, id: u64, payload: Value) -> Result<(), PoolError> {
        let bytes = codec::encode(&Frame { id, payload })?;
        let mut writer = self.writer.lock().await;
        let writer = match writer.as_mut() {
            Some(writer) => writer,
            None => return Err(self.shared.closed_error()),
        };
        let outcome = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = outcome {
            warn!("mailbox write for id {} failed: {}", id, err);
            self.shared.finalize(CloseReason::Died);
            return Err(PoolError::WorkerDied);
        }
        Ok(())
    }

    /// Wait for the response to `id`, draining its slot.
    pub async fn recv(&self, id: u64) -> Result<Value, PoolError> {
        let rx = match self.shared.pending.lock().remove(&id) {
            Some(rx) => rx,
            None => return Err(PoolError::Protocol(id)),
        };
        match rx.await {
            Ok(value) => Ok(value),
            Err(_) => Err(self.shared.closed_error()),
        }
    }

    /// Wait until some frame has arrived, without identifying which id.
    ///
    /// One arrived frame satisfies exactly one waiter; the pool pairs
    /// each dispatched request with exactly one `readable` wait, so the
    /// accounting stays exact.
    pub async fn readable(&self) -> Result<(), PoolError> {
        match self.shared.arrived.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(self.shared.closed_error()),
        }
    }

    /// True once the demultiplexer has stopped or the mailbox was closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.lock().is_some()
    }

    /// Orderly close: stop the demultiplexer, fail any slot still
    /// pending, and drop the writer (EOF to the peer).
    ///
    /// The demultiplexer is awaited after the abort. Cancellation only
    /// lands on its next read, and there is no await between the readable
    /// signal and slot delivery, so a frame whose arrival was already
    /// signalled is always delivered before the leftover slots are
    /// failed.
    pub async fn close(&self) {
        self.shared.set_reason(CloseReason::Shutdown);
        let demux = self.demux.lock().take();
        if let Some(demux) = demux {
            demux.abort();
            let _ = demux.await;
        }
        self.shared.finalize(CloseReason::Shutdown);
        self.writer.lock().await.take();
    }
}

/// Read frames until EOF, a fatal error, or cancellation; route each
/// payload to the slot registered for its id.
async fn demultiplex(shared: &Shared, reader: Reader) -> CloseReason {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = match reader.read_until(SENTINEL, &mut buf).await {
            Ok(n) => n,
            Err(err) => {
                warn!("mailbox read failed: {}", err);
                return CloseReason::Died;
            }
        };
        if n == 0 {
            return CloseReason::Died;
        }

        // Signal arrival before decoding: a parked scheduler releases the
        // worker while the payload is still being delivered.
        shared.arrived.add_permits(1);

        let frame = match codec::decode(&buf) {
            Ok(frame) => frame,
            Err(err) => {
                error!("dropping mailbox on undecodable frame: {}", err);
                return CloseReason::Codec(err.to_string());
            }
        };

        let slot = shared.slots.lock().remove(&frame.id);
        match slot {
            Some(slot) => {
                if slot.send(frame.payload).is_err() {
                    trace!("response for id {} dropped, receiver gone", frame.id);
                }
            }
            None => {
                error!("protocol violation: no slot for response id {}", frame.id);
                return CloseReason::Protocol(frame.id);
            }
        }
    }
}
