//! Request/response correlation.
//!
//! `send_request` looks synchronous to its caller: it writes the frame and
//! parks until the matching response fills the slot, the connection closes,
//! or shutdown is requested. Only the calling task waits; the reader tasks
//! keep running.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::connection::{lock, Connection};
use crate::error::RpcError;
use crate::transport::{encode_request, encode_response, Value};

/// Wait-loop tuning.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Length of one wait slice.
    pub wait_slice: Duration,
    /// Log a warning every this many slices without a response.
    pub warn_after_slices: u32,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            wait_slice: Duration::from_secs(1),
            warn_after_slices: 60,
        }
    }
}

/// Allocates packet ids and waits for responses.
pub struct Correlator {
    next_packet_id: Mutex<i32>,
    shutdown: watch::Sender<bool>,
    config: CorrelatorConfig,
}

impl Correlator {
    /// Correlator starting at packet id 0.
    pub fn new(config: CorrelatorConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            next_packet_id: Mutex::new(0),
            shutdown,
            config,
        })
    }

    /// Next packet id. Wraps around at `i32::MAX`.
    pub fn next_packet_id(&self) -> i32 {
        let mut next = lock(&self.next_packet_id);
        let id = *next;
        *next = next.wrapping_add(1);
        id
    }

    /// Wake every waiter with a shutdown error and refuse new requests.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether [`Correlator::shutdown`] was called.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Shutdown signal for other loops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Send `method(args)` on `conn`.
    ///
    /// Fire-and-forget requests return `Value::Void` as soon as the frame is
    /// written. A remote fault comes back as `Ok(fault)`; `Err` is reserved
    /// for failures of the mechanism itself.
    pub async fn send_request(
        &self,
        conn: &Connection,
        method: &str,
        args: &[Value],
        wants_response: bool,
    ) -> Result<Value, RpcError> {
        if self.is_shutting_down() {
            return Err(RpcError::Shutdown);
        }

        let packet_id = self.next_packet_id();
        let frame = encode_request(packet_id, method, args, wants_response);

        if !wants_response {
            conn.send_frame(&frame).await?;
            return Ok(Value::Void);
        }

        // The slot exists before any byte is written; dropping it on any
        // exit path removes it from the table.
        let mut slot = conn.register_pending(packet_id)?;
        conn.send_frame(&frame).await?;

        let mut shutdown = self.shutdown.subscribe();
        let mut slices: u32 = 0;
        loop {
            tokio::select! {
                biased;
                response = slot.receiver() => {
                    return response.map_err(|_| RpcError::NoResponse {
                        conn: conn.id(),
                        method: method.to_string(),
                    });
                }
                () = conn.closed() => {
                    debug!(conn = conn.id(), packet_id, method, "Connection closed while waiting");
                    return Err(RpcError::NoResponse {
                        conn: conn.id(),
                        method: method.to_string(),
                    });
                }
                () = async {
                    let _ = shutdown.wait_for(|stopping| *stopping).await;
                } => {
                    return Err(RpcError::Shutdown);
                }
                () = tokio::time::sleep(self.config.wait_slice) => {
                    slices += 1;
                    if self.config.warn_after_slices > 0 && slices % self.config.warn_after_slices == 0 {
                        warn!(
                            conn = conn.id(),
                            pid = ?conn.pid(),
                            packet_id,
                            method,
                            waited = ?self.config.wait_slice * slices,
                            "Still waiting for response"
                        );
                    }
                }
            }
        }
    }

    /// Answer request `packet_id` on `conn`.
    pub async fn send_response(&self, conn: &Connection, packet_id: i32, value: &Value) -> Result<(), RpcError> {
        conn.send_frame(&encode_response(packet_id, value)).await
    }
}
