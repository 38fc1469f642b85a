//! Worker side of the broker connection.
//!
//! A worker runs the same machinery as the broker in reverse: a reader task,
//! a dispatcher, a correlator and a router for the methods it serves.

mod script;

pub use script::ScriptHost;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::connection::{spawn_reader, Connection};
use crate::correlator::{Correlator, CorrelatorConfig};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::RpcError;
use crate::router::{MethodHandler, MethodRouter, REGISTER_RPC_METHOD};
use crate::server::REGISTER_CLIENT;
use crate::transport::unix;
use crate::transport::Value;

/// Tuning for a worker's side of the connection.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub dispatcher: DispatcherConfig,
    pub correlator: CorrelatorConfig,
    /// Connection attempts before giving up.
    pub connect_attempts: u32,
    /// Pause between connection attempts.
    pub connect_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            correlator: CorrelatorConfig::default(),
            connect_attempts: 50,
            connect_delay: Duration::from_millis(100),
        }
    }
}

/// Cheap handle for calling the broker from handlers.
#[derive(Clone)]
pub struct BrokerLink {
    conn: Arc<Connection>,
    correlator: Arc<Correlator>,
}

impl BrokerLink {
    /// Call a broker method and wait for its result. Remote faults are `Ok`.
    pub async fn call(&self, method: &str, args: &[Value]) -> Result<Value, RpcError> {
        self.correlator.send_request(&self.conn, method, args, true).await
    }

    /// Send without waiting for a response.
    pub async fn notify(&self, method: &str, args: &[Value]) -> Result<(), RpcError> {
        self.correlator
            .send_request(&self.conn, method, args, false)
            .await
            .map(|_| ())
    }

    /// Whether the broker connection is gone.
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

/// A connection to the broker that serves methods and can call the broker.
pub struct WorkerClient {
    pid: u32,
    link: BrokerLink,
    router: Arc<MethodRouter>,
    dispatcher: Arc<Dispatcher>,
}

impl WorkerClient {
    /// Connect to the broker socket. Handlers can be added before
    /// [`WorkerClient::register_client`] announces the worker.
    pub async fn connect(path: &Path, pid: u32) -> Result<Self> {
        Self::connect_with(path, pid, WorkerOptions::default()).await
    }

    /// [`WorkerClient::connect`] with explicit options.
    pub async fn connect_with(path: &Path, pid: u32, options: WorkerOptions) -> Result<Self> {
        let stream = unix::connect(path, options.connect_attempts, options.connect_delay)
            .await
            .context("Worker could not reach the broker")?;

        let correlator = Correlator::new(options.correlator);
        let router = MethodRouter::new(Arc::clone(&correlator));
        let dispatcher = Dispatcher::start(&options.dispatcher, router.clone(), Arc::clone(&correlator));
        let (conn, read_half) = Connection::new(0, stream);
        conn.set_pid(pid);
        spawn_reader(Arc::clone(&conn), read_half, dispatcher.clone());
        debug!(pid, socket = %path.display(), "Connected to broker");

        Ok(Self {
            pid,
            link: BrokerLink { conn, correlator },
            router,
            dispatcher,
        })
    }

    /// Pid sent in the handshake.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Handle for calling the broker from handlers.
    pub fn link(&self) -> BrokerLink {
        self.link.clone()
    }

    /// Serve `name` for calls coming from the broker only.
    pub fn serve_local(&self, name: &str, handler: Arc<dyn MethodHandler>) {
        self.router.register_local(name, handler);
    }

    /// Serve `name` and announce it so other processes can call it.
    pub async fn register_method(&self, name: &str, handler: Arc<dyn MethodHandler>) -> Result<(), RpcError> {
        let signatures = handler.signatures();
        self.router.register_local(name, handler);
        let args = [Value::from(name), Value::Array(signatures)];
        RpcError::check(self.link.call(REGISTER_RPC_METHOD, &args).await?)?;
        debug!(pid = self.pid, method = name, "Announced method");
        Ok(())
    }

    /// Complete the handshake by sending our pid.
    pub async fn register_client(&self) -> Result<(), RpcError> {
        let pid = i64::from(self.pid);
        RpcError::check(self.link.call(REGISTER_CLIENT, &[Value::Integer64(pid)]).await?)?;
        info!(pid = self.pid, "Registered with broker");
        Ok(())
    }

    /// Call a broker method and wait for its result.
    pub async fn call(&self, method: &str, args: &[Value]) -> Result<Value, RpcError> {
        self.link.call(method, args).await
    }

    /// Send without waiting for a response.
    pub async fn notify(&self, method: &str, args: &[Value]) -> Result<(), RpcError> {
        self.link.notify(method, args).await
    }

    /// Whether the broker connection is gone.
    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    /// Resolves when the broker connection goes away.
    pub async fn closed(&self) {
        self.link.conn.closed().await;
    }

    /// Disconnect and stop the local dispatcher.
    pub fn close(&self) {
        self.link.correlator.shutdown();
        self.link.conn.close();
        self.dispatcher.stop();
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        self.close();
    }
}
