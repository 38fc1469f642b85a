//! One accepted (or dialed) socket and its RPC state.
//!
//! A connection owns the write half of the socket behind the send lock, a
//! table of pending response slots keyed by packet id, and a `closed` flag
//! every waiter selects on. The read half lives in the reader task spawned
//! by [`spawn_reader`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::RpcError;
use crate::transport::{FrameDecoder, RawFrame, Value};

/// Scratch buffer size for socket reads.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Receives complete frames from a connection's reader task.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Handle one complete frame. Must not run method bodies.
    async fn deliver(&self, conn: &Arc<Connection>, frame: RawFrame);

    /// Called once after the reader task stopped and the connection is closed.
    fn disconnected(&self, _conn: &Arc<Connection>) {}
}

/// An RPC connection to a peer process.
pub struct Connection {
    id: u64,
    /// Peer process id, set once by the registration handshake.
    pid: OnceLock<u32>,
    closed: watch::Sender<bool>,
    /// Send lock. `None` once the connection has been torn down.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<HashMap<i32, oneshot::Sender<Value>>>,
    last_activity: Mutex<Instant>,
}

impl Connection {
    /// Wrap a stream. The read half goes to [`spawn_reader`].
    pub fn new(id: u64, stream: UnixStream) -> (Arc<Self>, OwnedReadHalf) {
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id,
            pid: OnceLock::new(),
            closed,
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
        });
        (conn, reader)
    }

    /// Broker-assigned connection id.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Peer pid, `None` until the peer registered.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Record the peer pid. Returns `false` if a pid was already set.
    pub fn set_pid(&self, pid: u32) -> bool {
        self.pid.set(pid).is_ok()
    }

    /// Whether the connection was closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so this only returns on close.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Mark the connection closed and fail every pending request.
    ///
    /// The socket itself is released by the reader task, so this never
    /// touches the registry or blocks.
    pub fn close(&self) {
        let was_closed = self.closed.send_replace(true);
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !was_closed {
            debug!(conn = self.id, pid = ?self.pid(), pending = drained.len(), "Connection closed");
        }
        // Dropping the senders wakes the waiters with an error.
        drop(drained);
    }

    /// Time since the last frame was read or written.
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    /// Record activity now.
    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// Create the response slot for `packet_id`. Must happen before the
    /// request is written.
    pub fn register_pending(&self, packet_id: i32) -> Result<PendingSlot<'_>, RpcError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            // Checked under the table lock: `close` drains under the same lock.
            if self.is_closed() {
                return Err(RpcError::ConnectionClosed(self.id));
            }
            if pending.insert(packet_id, tx).is_some() {
                warn!(conn = self.id, packet_id, "Replaced an in-flight slot with the same packet id");
            }
        }
        Ok(PendingSlot {
            conn: self,
            packet_id,
            rx,
        })
    }

    /// Fill the slot for `packet_id`. Returns `false` if nobody is waiting.
    pub fn complete(&self, packet_id: i32, value: Value) -> bool {
        let Some(tx) = lock(&self.pending).remove(&packet_id) else {
            return false;
        };
        tx.send(value).is_ok()
    }

    /// Requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn remove_pending(&self, packet_id: i32) {
        lock(&self.pending).remove(&packet_id);
    }

    /// Write one encoded frame under the send lock.
    ///
    /// A write failure closes the connection.
    pub async fn send_frame(&self, bytes: &[u8]) -> Result<(), RpcError> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut().filter(|_| !self.is_closed()) else {
            return Err(RpcError::ConnectionClosed(self.id));
        };

        if let Err(source) = stream.write_all(bytes).await {
            warn!(conn = self.id, pid = ?self.pid(), error = %source, "Write failed, closing connection");
            writer.take();
            drop(writer);
            self.close();
            return Err(RpcError::Transport {
                conn: self.id,
                source,
            });
        }

        trace!(conn = self.id, len = bytes.len(), "Frame written");
        self.touch();
        Ok(())
    }

    /// Drop the write half so the peer sees end-of-stream.
    async fn release_writer(&self) {
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// An in-flight request's response slot.
///
/// Removed from the connection's table when dropped, whatever the outcome.
pub struct PendingSlot<'a> {
    conn: &'a Connection,
    packet_id: i32,
    rx: oneshot::Receiver<Value>,
}

impl PendingSlot<'_> {
    /// Packet id this slot answers.
    pub const fn packet_id(&self) -> i32 {
        self.packet_id
    }

    /// Receiver side; errors when the connection is closed.
    pub fn receiver(&mut self) -> &mut oneshot::Receiver<Value> {
        &mut self.rx
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.conn.remove_pending(self.packet_id);
    }
}

/// Read frames from `reader` until end-of-stream, an error, or close.
///
/// Malformed frames are logged and dropped; the connection stays open.
pub fn spawn_reader(
    conn: Arc<Connection>,
    mut reader: OwnedReadHalf,
    sink: Arc<dyn FrameSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                () = conn.closed() => break,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!(conn = conn.id(), pid = ?conn.pid(), "Peer closed connection");
                    break;
                }
                Ok(n) => {
                    conn.touch();
                    decoder.feed(&buf[..n]);
                    loop {
                        match decoder.next_frame() {
                            Ok(Some(frame)) => sink.deliver(&conn, frame).await,
                            Ok(None) => break,
                            Err(e) => {
                                warn!(conn = conn.id(), pid = ?conn.pid(), error = %e, "Discarding malformed frame");
                            }
                        }
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    warn!(conn = conn.id(), pid = ?conn.pid(), error = %e, "Read failed");
                    break;
                }
            }
        }

        conn.close();
        conn.release_writer().await;
        sink.disconnected(&conn);
    })
}

/// Lock a std mutex, recovering from poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
