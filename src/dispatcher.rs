//! Three-queue dispatcher.
//!
//! Reader tasks only reassemble frames; everything past the header happens
//! here. Queue 0 runs inbound requests, queue 1 fills response slots and
//! queue 2 performs outbound notifications. Each queue has its own pool of
//! worker tasks so a slow method never delays response delivery.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::connection::{lock, Connection, FrameSink};
use crate::correlator::Correlator;
use crate::error::RpcError;
use crate::transport::{Frame, RawFrame, Value};

/// Runs the method named by an inbound request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Always produces a value; failures are fault values.
    async fn handle_request(&self, conn: &Arc<Connection>, method: &str, args: Vec<Value>) -> Value;
}

/// Queue sizing.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Bound of each queue.
    pub queue_capacity: usize,
    /// Worker tasks per queue.
    pub workers_per_queue: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            workers_per_queue: 5,
        }
    }
}

struct Inbound {
    conn: Arc<Connection>,
    frame: RawFrame,
}

struct Outbound {
    conn: Arc<Connection>,
    method: Arc<str>,
    args: Arc<[Value]>,
}

/// Index of each queue, used in log fields.
const REQUEST_QUEUE: usize = 0;
const RESPONSE_QUEUE: usize = 1;
const BROADCAST_QUEUE: usize = 2;

/// Three work queues between the reader tasks and method execution.
pub struct Dispatcher {
    requests: mpsc::Sender<Inbound>,
    responses: mpsc::Sender<Inbound>,
    broadcasts: mpsc::Sender<Outbound>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create the queues and start their workers.
    pub fn start(
        config: &DispatcherConfig,
        handler: Arc<dyn RequestHandler>,
        correlator: Arc<Correlator>,
    ) -> Arc<Self> {
        let capacity = config.queue_capacity.max(1);
        let (requests, request_rx) = mpsc::channel(capacity);
        let (responses, response_rx) = mpsc::channel(capacity);
        let (broadcasts, broadcast_rx) = mpsc::channel(capacity);

        let mut workers = Vec::with_capacity(config.workers_per_queue * 3);
        let n = config.workers_per_queue.max(1);

        let sender = Arc::clone(&correlator);
        workers.extend(spawn_pool(n, request_rx, move |job: Inbound| {
            let handler = Arc::clone(&handler);
            let correlator = Arc::clone(&correlator);
            async move { run_request(job, handler.as_ref(), &correlator).await }
        }));
        workers.extend(spawn_pool(n, response_rx, |job: Inbound| async move {
            deliver_response(job);
        }));
        workers.extend(spawn_pool(n, broadcast_rx, move |job: Outbound| {
            let sender = Arc::clone(&sender);
            async move { send_notification(job, &sender).await }
        }));

        Arc::new(Self {
            requests,
            responses,
            broadcasts,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a fire-and-forget `method(args)` to `conn`.
    ///
    /// Returns `false` if the item was dropped.
    pub fn notify(&self, conn: Arc<Connection>, method: impl Into<Arc<str>>, args: impl Into<Arc<[Value]>>) -> bool {
        let job = Outbound {
            conn,
            method: method.into(),
            args: args.into(),
        };
        enqueue(&self.broadcasts, BROADCAST_QUEUE, job, |job| (job.conn.id(), job.method.to_string()))
    }

    /// Queue the same notification to every connection. Returns how many were queued.
    pub fn broadcast<I>(&self, conns: I, method: &str, args: Vec<Value>) -> usize
    where
        I: IntoIterator<Item = Arc<Connection>>,
    {
        let method: Arc<str> = Arc::from(method);
        let args: Arc<[Value]> = Arc::from(args);
        conns
            .into_iter()
            .filter(|conn| !conn.is_closed())
            .filter(|conn| self.notify(Arc::clone(conn), Arc::clone(&method), Arc::clone(&args)))
            .count()
    }

    /// Stop all workers. Queued items are discarded.
    pub fn stop(&self) {
        for worker in lock(&self.workers).drain(..) {
            worker.abort();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl FrameSink for Dispatcher {
    async fn deliver(&self, conn: &Arc<Connection>, frame: RawFrame) {
        let (queue, index) = if frame.kind.is_request() {
            (&self.requests, REQUEST_QUEUE)
        } else {
            (&self.responses, RESPONSE_QUEUE)
        };
        let job = Inbound {
            conn: Arc::clone(conn),
            frame,
        };
        enqueue(queue, index, job, |job| {
            (job.conn.id(), job.frame.method.clone().unwrap_or_default())
        });
    }
}

/// Non-blocking enqueue; a full queue drops the item with an error log.
fn enqueue<T>(
    queue: &mpsc::Sender<T>,
    index: usize,
    job: T,
    describe: impl FnOnce(&T) -> (u64, String),
) -> bool {
    match queue.try_send(job) {
        Ok(()) => true,
        Err(TrySendError::Full(job)) => {
            let (conn, method) = describe(&job);
            error!(queue = index, conn, method = %method, "Queue full, dropping item");
            false
        }
        Err(TrySendError::Closed(job)) => {
            let (conn, method) = describe(&job);
            debug!(queue = index, conn, method = %method, "Queue closed, dropping item");
            false
        }
    }
}

fn spawn_pool<T, F, Fut>(workers: usize, rx: mpsc::Receiver<T>, run: F) -> Vec<JoinHandle<()>>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..workers)
        .map(|_| {
            let rx = Arc::clone(&rx);
            let run = run.clone();
            tokio::spawn(async move {
                loop {
                    // Only one worker waits on the receiver at a time.
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => run(job).await,
                        None => break,
                    }
                }
            })
        })
        .collect()
}

async fn run_request(job: Inbound, handler: &dyn RequestHandler, correlator: &Correlator) {
    let Inbound { conn, frame } = job;
    let packet_id = frame.packet_id;
    let wants_response = frame.wants_response;

    let value = match frame.decode() {
        Ok(Frame::Request(request)) => {
            handler.handle_request(&conn, &request.method, request.args).await
        }
        Ok(Frame::Response(_)) => {
            warn!(conn = conn.id(), packet_id, "Response frame on request queue");
            return;
        }
        Err(e) => {
            warn!(conn = conn.id(), pid = ?conn.pid(), packet_id, method = ?frame.method, error = %e, "Undecodable request");
            RpcError::from(e).into_fault()
        }
    };

    if wants_response {
        if let Err(e) = correlator.send_response(&conn, packet_id, &value).await {
            warn!(conn = conn.id(), pid = ?conn.pid(), packet_id, error = %e, "Failed to send response");
        }
    }
}

fn deliver_response(job: Inbound) {
    let Inbound { conn, frame } = job;
    let packet_id = frame.packet_id;
    let value = match frame.decode() {
        Ok(Frame::Response(response)) => response.value,
        Ok(Frame::Request(_)) => {
            warn!(conn = conn.id(), packet_id, "Request frame on response queue");
            return;
        }
        Err(e) => {
            warn!(conn = conn.id(), pid = ?conn.pid(), packet_id, error = %e, "Undecodable response");
            // Wake the waiter rather than leave it parked.
            RpcError::from(e).into_fault()
        }
    };
    if !conn.complete(packet_id, value) {
        debug!(conn = conn.id(), packet_id, "No waiter for response");
    }
}

async fn send_notification(job: Outbound, sender: &Correlator) {
    let Outbound { conn, method, args } = job;
    if let Err(e) = sender.send_request(&conn, &method, &args, false).await {
        debug!(conn = conn.id(), pid = ?conn.pid(), method = %method, error = %e, "Notification not delivered");
    }
}
