//! The broker: socket listener, accept loop and built-in methods.
//!
//! One accept task owns the listening socket. Each accepted connection gets
//! a reader task that reassembles frames and hands them to the dispatcher;
//! only the `registerClient` handshake is answered in the read path itself.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::connection::{lock, spawn_reader, Connection, FrameSink};
use crate::correlator::Correlator;
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::pool::{ProcessPool, UnitExit};
use crate::registry::ConnectionRegistry;
use crate::router::{handler_fn, CallContext, MethodRouter};
use crate::spawner::ProcessSpawner;
use crate::transport::unix::bind_listener;
use crate::transport::{Frame, RawFrame, Value};
use crate::units::{UnitManager, UnitSpec, START_UNIT, STOP_UNIT, UNIT_FINISHED};

/// Bootstrap call a worker makes with its pid.
pub const REGISTER_CLIENT: &str = "registerClient";
/// Built-in: list running units.
pub const LIST_UNITS: &str = "listUnits";
/// Built-in: fan a notification out to every worker.
pub const BROADCAST_EVENT: &str = "broadcastEvent";

/// How long `stop` waits for worker processes to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// The broker and every component it owns.
pub struct Broker {
    config: BrokerConfig,
    correlator: Arc<Correlator>,
    router: Arc<MethodRouter>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<ProcessPool>,
    units: Arc<UnitManager>,
    last_gc: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Build every component. Must run inside a tokio runtime.
    pub fn new(config: BrokerConfig, spawner: Arc<dyn ProcessSpawner>) -> Result<Arc<Self>> {
        config.validate()?;

        let correlator = Correlator::new(config.correlator.clone());
        let router = MethodRouter::new(Arc::clone(&correlator));
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&router)));
        let dispatcher = Dispatcher::start(&config.dispatcher, router.clone(), Arc::clone(&correlator));
        let (pool, events) = ProcessPool::new(
            config.pool.clone(),
            spawner,
            Arc::clone(&registry),
            config.socket_path.clone(),
        );
        let units = UnitManager::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::clone(&correlator),
        );
        let event_loop = units.spawn_event_loop(events);

        let broker = Arc::new(Self {
            config,
            correlator,
            router,
            registry,
            dispatcher,
            pool,
            units,
            last_gc: Mutex::new(Instant::now()),
            tasks: Mutex::new(vec![event_loop]),
        });
        broker.register_builtins();
        Ok(broker)
    }

    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub const fn router(&self) -> &Arc<MethodRouter> {
        &self.router
    }

    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub const fn pool(&self) -> &Arc<ProcessPool> {
        &self.pool
    }

    pub const fn units(&self) -> &Arc<UnitManager> {
        &self.units
    }

    /// Bind the listening socket.
    pub fn bind(&self) -> Result<UnixListener> {
        let listener = bind_listener(&self.config.socket_path, self.config.socket_mode)?;
        info!(
            socket = %self.config.socket_path.display(),
            max_connections = self.config.max_connections,
            "Broker listening"
        );
        Ok(listener)
    }

    /// Bind and serve until [`Broker::stop`] is called.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(self: &Arc<Self>, listener: UnixListener) {
        let mut shutdown = self.correlator.shutdown_signal();
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        if let Err(e) = self.accept(stream) {
                            warn!(error = %e, "Connection refused");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                },
                _ = tick.tick() => self.maybe_collect_garbage(),
                () = async {
                    let _ = shutdown.wait_for(|stopping| *stopping).await;
                } => break,
            }
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            debug!(error = %e, "Socket file not removed");
        }
        info!("Broker accept loop stopped");
    }

    /// Take ownership of a new stream.
    pub fn accept(self: &Arc<Self>, stream: UnixStream) -> Result<Arc<Connection>, RpcError> {
        let max = self.config.max_connections;
        if self.registry.len() >= max {
            self.collect_garbage();
            if self.registry.len() >= max {
                // Dropping the stream closes it right away.
                return Err(RpcError::TooManyConnections(max));
            }
        }

        let (conn, reader) = Connection::new(self.registry.next_id(), stream);
        self.registry.add(Arc::clone(&conn));
        let sink: Arc<dyn FrameSink> = self.clone();
        spawn_reader(Arc::clone(&conn), reader, sink);
        debug!(conn = conn.id(), connections = self.registry.len(), "Accepted connection");
        Ok(conn)
    }

    fn maybe_collect_garbage(&self) {
        let due = lock(&self.last_gc).elapsed() >= self.config.gc_interval;
        let pressure = self.registry.len() >= self.config.gc_pressure_threshold();
        if due || pressure {
            self.collect_garbage();
        }
    }

    /// Reclaim closed connections and idle worker processes.
    pub fn collect_garbage(&self) -> usize {
        *lock(&self.last_gc) = Instant::now();
        let connections = self.registry.collect_closed().len();
        let processes = self.pool.collect_garbage();
        if connections + processes > 0 {
            debug!(connections, processes, "Garbage collected");
        }
        connections + processes
    }

    /// Call a method from inside the broker. Failures come back as fault values.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Value {
        self.router.call(method, args).await
    }

    /// Send a fire-and-forget notification to every open connection.
    pub fn broadcast(&self, method: &str, args: Vec<Value>) -> usize {
        self.dispatcher
            .broadcast(self.registry.open_connections(), method, args)
    }

    /// Stop accepting, release every waiter and terminate the workers.
    pub async fn stop(&self) {
        info!("Stopping broker");
        self.correlator.shutdown();
        self.pool.stop_all(STOP_TIMEOUT).await;
        self.registry.close_all();
        self.dispatcher.stop();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    /// Answer `registerClient(pid)` on the read path.
    async fn register_client(&self, conn: &Arc<Connection>, frame: &RawFrame) {
        let request = match frame.decode() {
            Ok(Frame::Request(request)) => request,
            Ok(Frame::Response(_)) => return,
            Err(e) => {
                warn!(conn = conn.id(), error = %e, "Undecodable registration");
                return;
            }
        };

        let pid = request
            .args
            .first()
            .and_then(Value::as_i64)
            .and_then(|pid| u32::try_from(pid).ok());
        let result = match pid {
            None => RpcError::invalid_params(REGISTER_CLIENT, "expected process id").into_fault(),
            Some(pid) if !conn.set_pid(pid) => {
                RpcError::invalid_params(REGISTER_CLIENT, "connection already registered").into_fault()
            }
            Some(pid) => {
                let pooled = self.pool.attach_connection(pid, conn);
                info!(conn = conn.id(), pid, pooled, "Client registered");
                Value::Boolean(true)
            }
        };

        if request.wants_response {
            if let Err(e) = self.correlator.send_response(conn, request.packet_id, &result).await {
                warn!(conn = conn.id(), error = %e, "Failed to answer registration");
            }
        }
    }

    fn register_builtins(&self) {
        let pool = Arc::downgrade(&self.pool);
        self.router.register_local(
            UNIT_FINISHED,
            handler_fn(move |ctx: CallContext, args: Vec<Value>| {
                let pool = pool.clone();
                async move {
                    let pool = upgrade(&pool)?;
                    let pid = ctx
                        .caller_pid()
                        .ok_or_else(|| RpcError::invalid_params(UNIT_FINISHED, "caller is not registered"))?;
                    let unit_id = arg_str(UNIT_FINISHED, &args, 0)?;
                    let code = args
                        .get(1)
                        .and_then(Value::as_i32)
                        .ok_or_else(|| RpcError::invalid_params(UNIT_FINISHED, "expected exit code"))?;
                    Ok(Value::Boolean(pool.finish_unit(pid, unit_id, UnitExit::from_code(code))))
                }
            }),
        );

        let units = Arc::downgrade(&self.units);
        self.router.register_local(
            START_UNIT,
            handler_fn(move |_ctx, args: Vec<Value>| {
                let units = units.clone();
                async move {
                    let units = upgrade(&units)?;
                    let unit_id = arg_str(START_UNIT, &args, 0)?;
                    let spec = UnitSpec::from_value(args.get(1).unwrap_or(&Value::Void))?;
                    let pid = units.start_unit(unit_id, spec).await?;
                    Ok(Value::from(pid))
                }
            }),
        );

        let units = Arc::downgrade(&self.units);
        self.router.register_local(
            STOP_UNIT,
            handler_fn(move |_ctx, args: Vec<Value>| {
                let units = units.clone();
                async move {
                    let units = upgrade(&units)?;
                    units.stop_unit(arg_str(STOP_UNIT, &args, 0)?).await?;
                    Ok(Value::Boolean(true))
                }
            }),
        );

        let units = Arc::downgrade(&self.units);
        self.router.register_local(
            LIST_UNITS,
            handler_fn(move |_ctx, _args| {
                let units = units.clone();
                async move {
                    let listed: BTreeMap<String, Value> = upgrade(&units)?
                        .list_units()
                        .into_iter()
                        .map(|(unit, pid)| (unit, Value::from(pid)))
                        .collect();
                    Ok(Value::Struct(listed))
                }
            }),
        );

        let dispatcher = Arc::downgrade(&self.dispatcher);
        let registry = Arc::downgrade(&self.registry);
        self.router.register_local(
            BROADCAST_EVENT,
            handler_fn(move |_ctx, args: Vec<Value>| {
                let dispatcher = dispatcher.clone();
                let registry = registry.clone();
                async move {
                    let method = arg_str(BROADCAST_EVENT, &args, 0)?.to_string();
                    let payload = match args.into_iter().nth(1) {
                        Some(Value::Array(values)) => values,
                        None | Some(Value::Void) => Vec::new(),
                        Some(other) => vec![other],
                    };
                    let conns = upgrade(&registry)?.open_connections();
                    let queued = upgrade(&dispatcher)?.broadcast(conns, &method, payload);
                    Ok(Value::from(u32::try_from(queued).unwrap_or(u32::MAX)))
                }
            }),
        );
    }
}

#[async_trait]
impl FrameSink for Broker {
    async fn deliver(&self, conn: &Arc<Connection>, frame: RawFrame) {
        if frame.kind.is_request() && frame.method.as_deref() == Some(REGISTER_CLIENT) {
            self.register_client(conn, &frame).await;
            return;
        }
        self.dispatcher.deliver(conn, frame).await;
    }

    fn disconnected(&self, conn: &Arc<Connection>) {
        self.registry.remove(conn.id());
    }
}

fn upgrade<T>(weak: &Weak<T>) -> Result<Arc<T>, RpcError> {
    weak.upgrade().ok_or(RpcError::Shutdown)
}

fn arg_str<'a>(method: &str, args: &'a [Value], index: usize) -> Result<&'a str, RpcError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params(method, format!("argument {index} must be a string")))
}
