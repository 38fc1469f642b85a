//! Worker process pool.
//!
//! Processes are keyed by pid. Each carries the units it runs and their
//! cost; a process is reused while its total cost plus the new unit's cost
//! stays within the per-process cap. When nothing fits, a new process is
//! spawned and the caller waits until it completes the registration
//! handshake over the broker socket.
//!
//! Process exit is observed by one watcher task per process. Unit
//! completions and restart requests leave the pool as [`PoolEvent`]s.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::connection::{lock, Connection};
use crate::error::RpcError;
use crate::registry::ConnectionRegistry;
use crate::spawner::{ChildProcess, ExitOutcome, ProcessSpawner, SpawnedProcess};

/// Exit code reported for units stopped on request.
pub const EXIT_STOPPED: i32 = -32700;
/// Exit code reported for units whose process was killed by a signal.
pub const EXIT_SIGNALED: i32 = -32701;
/// Exit code reported for units whose process lost its broker connection.
pub const EXIT_LOST: i32 = -32702;

/// Pool limits and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum total unit cost one process may carry.
    pub max_cost_per_process: u32,
    /// How long a spawned process has to register.
    pub spawn_timeout: Duration,
    /// Idle time after which an empty process may be closed.
    pub idle_grace: Duration,
    /// Ask for a full restart after a process died from a signal.
    pub restart_on_crash: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_cost_per_process: 40,
            spawn_timeout: Duration::from_secs(30),
            idle_grace: Duration::from_secs(60),
            restart_on_crash: true,
        }
    }
}

/// Why a unit stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitExit {
    /// The unit (or its process) exited with this code.
    Exited(i32),
    /// The process was killed by this signal.
    Signaled(i32),
    /// The broker stopped it.
    Stopped,
    /// The process lost its connection and was reclaimed.
    Lost,
}

impl UnitExit {
    /// Code passed to `unitFinished`.
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(_) => EXIT_SIGNALED,
            Self::Stopped => EXIT_STOPPED,
            Self::Lost => EXIT_LOST,
        }
    }

    /// Inverse of [`UnitExit::code`] for codes reported by workers.
    pub const fn from_code(code: i32) -> Self {
        match code {
            EXIT_STOPPED => Self::Stopped,
            EXIT_SIGNALED => Self::Signaled(0),
            EXIT_LOST => Self::Lost,
            code => Self::Exited(code),
        }
    }

    /// Whether the unit ended without anyone asking, through no exit of its own.
    pub const fn is_crash(self) -> bool {
        matches!(self, Self::Signaled(_) | Self::Lost)
    }
}

/// Notifications published by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A unit stopped running, on its own or with its process.
    UnitFinished { unit_id: String, pid: u32, exit: UnitExit },
    /// A process crashed and restarts are enabled.
    RestartRequested { pid: u32, exit: UnitExit },
}

/// Why the pool asked a process to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// Shutdown, garbage collection of an idle process, or a spawn timeout.
    Requested,
    /// Its connection closed while the process was still alive.
    ConnectionLost,
}

/// Snapshot of one pool entry.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Connection id once the process registered.
    pub conn_id: Option<u64>,
    /// Total cost of its units.
    pub cost: u32,
    /// Unit ids, sorted.
    pub units: Vec<String>,
    /// Time since the last unit change or frame.
    pub idle: Duration,
}

struct ProcessEntry {
    conn: Option<Arc<Connection>>,
    registered: watch::Sender<Option<Arc<Connection>>>,
    /// Unit id to cost.
    units: HashMap<String, u32>,
    /// Units that reported completion but were not unregistered yet.
    finished: HashSet<String>,
    last_execution: Instant,
    stop: Option<StopReason>,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessEntry {
    fn cost(&self) -> u32 {
        self.units.values().fold(0, |total, cost| total.saturating_add(*cost))
    }

    /// Whether `required` more cost still fits under `limit`.
    fn fits(&self, required: u32, limit: u32) -> bool {
        self.cost().checked_add(required).is_some_and(|total| total <= limit)
    }

    fn usable(&self) -> Option<&Arc<Connection>> {
        self.conn.as_ref().filter(|conn| self.stop.is_none() && !conn.is_closed())
    }

    fn idle_for(&self) -> Duration {
        let conn_idle = self.conn.as_ref().map_or(Duration::MAX, |conn| conn.idle_for());
        self.last_execution.elapsed().min(conn_idle)
    }
}

/// Worker processes keyed by pid.
pub struct ProcessPool {
    processes: Mutex<BTreeMap<u32, ProcessEntry>>,
    changed: Notify,
    spawner: Arc<dyn ProcessSpawner>,
    registry: Arc<ConnectionRegistry>,
    socket_path: PathBuf,
    config: PoolConfig,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl ProcessPool {
    /// Empty pool. Events are delivered on the returned receiver.
    pub fn new(
        config: PoolConfig,
        spawner: Arc<dyn ProcessSpawner>,
        registry: Arc<ConnectionRegistry>,
        socket_path: PathBuf,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            processes: Mutex::new(BTreeMap::new()),
            changed: Notify::new(),
            spawner,
            registry,
            socket_path,
            config,
            events,
        });
        (pool, rx)
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// A registered process with room for `required` more cost.
    ///
    /// Spawns one if none qualifies and waits for its registration.
    pub async fn get_free_process(self: &Arc<Self>, required: u32) -> Result<(u32, Arc<Connection>), RpcError> {
        let limit = self.config.max_cost_per_process;
        if required > limit {
            return Err(RpcError::Capacity { required, limit });
        }

        {
            let mut processes = lock(&self.processes);
            let found = processes.iter_mut().find_map(|(pid, entry)| {
                let conn = entry.usable()?;
                entry.fits(required, limit).then(|| (*pid, Arc::clone(conn)))
            });
            if let Some((pid, conn)) = found {
                if let Some(entry) = processes.get_mut(&pid) {
                    entry.last_execution = Instant::now();
                }
                debug!(pid, required, "Reusing worker process");
                return Ok((pid, conn));
            }
        }

        self.spawn_process().await
    }

    #[instrument(skip(self), fields(socket = %self.socket_path.display()))]
    async fn spawn_process(self: &Arc<Self>) -> Result<(u32, Arc<Connection>), RpcError> {
        let SpawnedProcess { pid, child } = self.spawner.spawn(&self.socket_path).await.map_err(|e| {
            error!(error = %format!("{e:#}"), "Spawning worker failed");
            RpcError::Spawn(format!("{e:#}"))
        })?;

        let (registered, mut rx) = watch::channel(None);
        let (kill, kill_rx) = oneshot::channel();
        lock(&self.processes).insert(
            pid,
            ProcessEntry {
                conn: None,
                registered,
                units: HashMap::new(),
                finished: HashSet::new(),
                last_execution: Instant::now(),
                stop: None,
                kill: Some(kill),
            },
        );
        self.watch_exit(pid, child, kill_rx);

        // The worker may have registered before its entry existed.
        if let Some(conn) = self.registry.find_by_pid(pid) {
            self.attach_connection(pid, &conn);
        }

        let timeout = self.config.spawn_timeout;
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(Option::is_some).await.map(|conn| conn.clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(conn))) => {
                info!(pid, conn = conn.id(), "Worker process registered");
                Ok((pid, conn))
            }
            Ok(_) => {
                warn!(pid, "Worker process exited before registering");
                Err(RpcError::Spawn(format!("worker {pid} exited before registering")))
            }
            Err(_) => {
                warn!(pid, ?timeout, "Worker process did not register in time");
                self.stop_process(pid);
                Err(RpcError::SpawnTimeout { pid, timeout })
            }
        }
    }

    fn watch_exit(self: &Arc<Self>, pid: u32, mut child: Box<dyn ChildProcess>, kill: oneshot::Receiver<()>) {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = child.wait() => outcome,
                Ok(()) = kill => {
                    if let Err(e) = child.kill().await {
                        warn!(pid, error = %e, "Failed to kill worker process");
                    }
                    child.wait().await
                }
            };
            let outcome = outcome.unwrap_or_else(|e| {
                warn!(pid, error = %e, "Failed to wait for worker process");
                ExitOutcome::Exited(-1)
            });
            if let Some(pool) = pool.upgrade() {
                pool.on_process_exit(pid, outcome);
            }
        });
    }

    /// Link a registered connection to the process that owns `pid`.
    ///
    /// Returns `false` for processes the pool did not spawn.
    pub fn attach_connection(&self, pid: u32, conn: &Arc<Connection>) -> bool {
        let mut processes = lock(&self.processes);
        let Some(entry) = processes.get_mut(&pid) else {
            return false;
        };
        if entry.conn.is_some() {
            return false;
        }
        entry.conn = Some(Arc::clone(conn));
        entry.last_execution = Instant::now();
        entry.registered.send_replace(Some(Arc::clone(conn)));
        true
    }

    /// Assign a unit to process `pid`.
    pub fn register_unit(&self, pid: u32, unit_id: &str, cost: u32) -> Result<(), RpcError> {
        let limit = self.config.max_cost_per_process;
        let mut processes = lock(&self.processes);
        let entry = processes.get_mut(&pid).ok_or(RpcError::UnknownProcess(pid))?;
        let current = entry.cost() - entry.units.get(unit_id).copied().unwrap_or(0);
        let total = current.saturating_add(cost);
        if total > limit {
            return Err(RpcError::Capacity { required: total, limit });
        }
        entry.units.insert(unit_id.to_string(), cost);
        entry.finished.remove(unit_id);
        entry.last_execution = Instant::now();
        debug!(pid, unit = unit_id, cost, total, "Unit registered");
        Ok(())
    }

    /// Detach a unit from `pid`, forgetting its finished state as well.
    pub fn unregister_unit(&self, pid: u32, unit_id: &str) -> bool {
        let mut processes = lock(&self.processes);
        let Some(entry) = processes.get_mut(&pid) else {
            return false;
        };
        let was_running = entry.units.remove(unit_id).is_some();
        let was_finished = entry.finished.remove(unit_id);
        entry.last_execution = Instant::now();
        was_running || was_finished
    }

    /// Record that `unit_id` on process `pid` finished and publish it.
    pub fn finish_unit(&self, pid: u32, unit_id: &str, exit: UnitExit) -> bool {
        {
            let mut processes = lock(&self.processes);
            let Some(entry) = processes.get_mut(&pid) else {
                return false;
            };
            if entry.units.remove(unit_id).is_none() {
                return false;
            }
            entry.finished.insert(unit_id.to_string());
            entry.last_execution = Instant::now();
        }
        info!(pid, unit = unit_id, code = exit.code(), "Unit finished");
        self.publish(PoolEvent::UnitFinished {
            unit_id: unit_id.to_string(),
            pid,
            exit,
        });
        true
    }

    /// The process running `unit_id`.
    pub fn find_unit(&self, unit_id: &str) -> Option<(u32, Option<Arc<Connection>>)> {
        lock(&self.processes)
            .iter()
            .find(|(_, entry)| entry.units.contains_key(unit_id))
            .map(|(pid, entry)| (*pid, entry.conn.clone()))
    }

    /// Snapshot of every process, by pid.
    pub fn processes(&self) -> Vec<ProcessInfo> {
        lock(&self.processes)
            .iter()
            .map(|(pid, entry)| {
                let mut units: Vec<String> = entry.units.keys().cloned().collect();
                units.sort();
                ProcessInfo {
                    pid: *pid,
                    conn_id: entry.conn.as_ref().map(|conn| conn.id()),
                    cost: entry.cost(),
                    units,
                    idle: entry.idle_for(),
                }
            })
            .collect()
    }

    /// Number of processes, registered or not.
    pub fn len(&self) -> usize {
        lock(&self.processes).len()
    }

    /// Whether no process is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn on_process_exit(&self, pid: u32, outcome: ExitOutcome) {
        let Some(entry) = lock(&self.processes).remove(&pid) else {
            return;
        };
        self.changed.notify_waiters();

        if let Some(conn) = &entry.conn {
            self.registry.remove(conn.id());
        }

        let exit = match (entry.stop, outcome) {
            (Some(StopReason::Requested), _) => UnitExit::Stopped,
            (Some(StopReason::ConnectionLost), _) => UnitExit::Lost,
            (None, ExitOutcome::Exited(code)) => UnitExit::Exited(code),
            (None, ExitOutcome::Signaled(signal)) => UnitExit::Signaled(signal),
        };

        if entry.stop == Some(StopReason::Requested) {
            info!(pid, ?outcome, "Worker process stopped");
        } else if entry.stop == Some(StopReason::ConnectionLost) {
            error!(pid, ?outcome, units = entry.units.len(), "Worker process reclaimed after losing its connection");
        } else if outcome.is_signal() {
            error!(pid, ?outcome, units = entry.units.len(), "Worker process killed by signal");
        } else {
            warn!(pid, ?outcome, units = entry.units.len(), "Worker process exited");
        }

        let mut units: Vec<&String> = entry.units.keys().collect();
        units.sort();
        for unit_id in units {
            self.publish(PoolEvent::UnitFinished {
                unit_id: unit_id.clone(),
                pid,
                exit,
            });
        }

        if exit.is_crash() && self.config.restart_on_crash {
            self.publish(PoolEvent::RestartRequested { pid, exit });
        }
    }

    fn publish(&self, event: PoolEvent) {
        if self.events.send(event).is_err() {
            debug!("Pool event dropped, no listener");
        }
    }

    /// Ask process `pid` to go away. Its exit is reported as a requested stop.
    pub fn stop_process(&self, pid: u32) -> bool {
        self.terminate(pid, StopReason::Requested)
    }

    fn terminate(&self, pid: u32, reason: StopReason) -> bool {
        let (conn, kill) = {
            let mut processes = lock(&self.processes);
            let Some(entry) = processes.get_mut(&pid) else {
                return false;
            };
            entry.stop = Some(reason);
            (entry.conn.clone(), entry.kill.take())
        };
        if let Some(conn) = conn {
            self.registry.remove(conn.id());
        }
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        true
    }

    /// Close idle processes. Returns how many were asked to stop.
    ///
    /// A process is a candidate when it runs no unit and has been idle past
    /// the grace period; the most recently active candidate is kept warm.
    /// Processes whose connection already closed are always reclaimed.
    pub fn collect_garbage(&self) -> usize {
        let (lost, idle): (Vec<u32>, Vec<u32>) = {
            let processes = lock(&self.processes);
            let lost: Vec<u32> = processes
                .iter()
                .filter(|(_, entry)| entry.stop.is_none())
                .filter(|(_, entry)| entry.conn.as_ref().is_some_and(|conn| conn.is_closed()))
                .map(|(pid, _)| *pid)
                .collect();

            let mut idle: Vec<(Duration, u32)> = processes
                .iter()
                .filter(|(_, entry)| entry.usable().is_some() && entry.units.is_empty())
                .map(|(pid, entry)| (entry.idle_for(), *pid))
                .filter(|(idle, _)| *idle >= self.config.idle_grace)
                .collect();
            idle.sort();
            (lost, idle.into_iter().skip(1).map(|(_, pid)| pid).collect())
        };

        for pid in &lost {
            warn!(pid, "Reclaiming worker process whose connection closed");
            self.terminate(*pid, StopReason::ConnectionLost);
        }
        for pid in &idle {
            debug!(pid, "Collecting idle worker process");
            self.terminate(*pid, StopReason::Requested);
        }
        let closed = lost.len() + idle.len();
        if closed > 0 {
            info!(closed, remaining = self.len(), "Pool garbage collection");
        }
        closed
    }

    /// Stop every process and wait up to `timeout` for them to exit.
    pub async fn stop_all(&self, timeout: Duration) -> bool {
        let pids: Vec<u32> = lock(&self.processes).keys().copied().collect();
        for pid in pids {
            self.stop_process(pid);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.changed.notified();
            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                let left = self.len();
                warn!(left, "Worker processes still running after stop");
                return left == 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{Correlator, CorrelatorConfig};
    use crate::router::MethodRouter;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::UnixStream;

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        /// Connect and register before `spawn` returns.
        Register,
        /// Never register.
        Silent,
    }

    struct FakeChild {
        exit: oneshot::Receiver<ExitOutcome>,
        killed: bool,
    }

    #[async_trait]
    impl ChildProcess for FakeChild {
        async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
            if self.killed {
                return Ok(ExitOutcome::Signaled(9));
            }
            Ok((&mut self.exit).await.unwrap_or(ExitOutcome::Exited(0)))
        }

        async fn kill(&mut self) -> std::io::Result<()> {
            self.killed = true;
            Ok(())
        }
    }

    struct FakeSpawner {
        mode: Mode,
        next_pid: AtomicU32,
        registry: Arc<ConnectionRegistry>,
        exits: Mutex<HashMap<u32, oneshot::Sender<ExitOutcome>>>,
        peers: Mutex<Vec<UnixStream>>,
    }

    #[async_trait]
    impl ProcessSpawner for FakeSpawner {
        async fn spawn(&self, _socket_path: &Path) -> anyhow::Result<SpawnedProcess> {
            let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            lock(&self.exits).insert(pid, tx);
            if self.mode == Mode::Register {
                let (a, b) = UnixStream::pair()?;
                let (conn, _reader) = Connection::new(self.registry.next_id(), a);
                conn.set_pid(pid);
                self.registry.add(conn);
                lock(&self.peers).push(b);
            }
            Ok(SpawnedProcess {
                pid,
                child: Box::new(FakeChild { exit: rx, killed: false }),
            })
        }
    }

    impl FakeSpawner {
        fn exit(&self, pid: u32, outcome: ExitOutcome) {
            lock(&self.exits).remove(&pid).unwrap().send(outcome).unwrap();
        }
    }

    struct Fixture {
        pool: Arc<ProcessPool>,
        events: mpsc::UnboundedReceiver<PoolEvent>,
        spawner: Arc<FakeSpawner>,
        registry: Arc<ConnectionRegistry>,
    }

    fn fixture(mode: Mode, config: PoolConfig) -> Fixture {
        let router = MethodRouter::new(Correlator::new(CorrelatorConfig::default()));
        let registry = Arc::new(ConnectionRegistry::new(router));
        let spawner = Arc::new(FakeSpawner {
            mode,
            next_pid: AtomicU32::new(1000),
            registry: Arc::clone(&registry),
            exits: Mutex::new(HashMap::new()),
            peers: Mutex::new(Vec::new()),
        });
        let (pool, events) = ProcessPool::new(
            config,
            spawner.clone(),
            Arc::clone(&registry),
            PathBuf::from("/tmp/unused.sock"),
        );
        Fixture {
            pool,
            events,
            spawner,
            registry,
        }
    }

    #[tokio::test]
    async fn reuses_process_within_capacity() {
        let f = fixture(Mode::Register, PoolConfig::default());

        let (pid, _) = f.pool.get_free_process(30).await.unwrap();
        f.pool.register_unit(pid, "a", 30).unwrap();

        let (same, _) = f.pool.get_free_process(10).await.unwrap();
        assert_eq!(same, pid);
        f.pool.register_unit(same, "b", 10).unwrap();

        // 40 is full; the next unit needs a second process.
        let (other, _) = f.pool.get_free_process(1).await.unwrap();
        assert_ne!(other, pid);
        assert_eq!(f.pool.len(), 2);

        for info in f.pool.processes() {
            assert!(info.cost <= 40);
        }
    }

    #[tokio::test]
    async fn oversized_request_never_spawns() {
        let f = fixture(Mode::Register, PoolConfig::default());
        let result = f.pool.get_free_process(41).await;
        assert!(matches!(result, Err(RpcError::Capacity { required: 41, limit: 40 })));
        assert!(f.pool.is_empty());
    }

    #[tokio::test]
    async fn register_unit_enforces_cap() {
        let f = fixture(Mode::Register, PoolConfig::default());
        let (pid, _) = f.pool.get_free_process(0).await.unwrap();
        f.pool.register_unit(pid, "a", 35).unwrap();
        tokio_test::assert_err!(f.pool.register_unit(pid, "b", 6));
        tokio_test::assert_err!(f.pool.register_unit(99, "b", 1));
        // Re-registering replaces the old cost.
        tokio_test::assert_ok!(f.pool.register_unit(pid, "a", 40));
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_timeout_kills_process() {
        let config = PoolConfig {
            spawn_timeout: Duration::from_secs(30),
            ..PoolConfig::default()
        };
        let mut f = fixture(Mode::Silent, config);

        let result = f.pool.get_free_process(1).await;
        assert!(matches!(result, Err(RpcError::SpawnTimeout { pid: 1000, .. })));

        // The killed placeholder goes away without reporting any unit.
        f.pool.stop_all(Duration::from_secs(1)).await;
        assert!(f.pool.is_empty());
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn signal_death_finishes_units_and_requests_restart() {
        let mut f = fixture(Mode::Register, PoolConfig::default());
        let (pid, conn) = f.pool.get_free_process(1).await.unwrap();
        f.pool.register_unit(pid, "a", 1).unwrap();
        f.pool.register_unit(pid, "b", 1).unwrap();

        f.spawner.exit(pid, ExitOutcome::Signaled(9));

        for unit in ["a", "b"] {
            let event = f.events.recv().await.unwrap();
            assert_eq!(
                event,
                PoolEvent::UnitFinished {
                    unit_id: unit.to_string(),
                    pid,
                    exit: UnitExit::Signaled(9)
                }
            );
        }
        assert_eq!(
            f.events.recv().await.unwrap(),
            PoolEvent::RestartRequested {
                pid,
                exit: UnitExit::Signaled(9)
            }
        );
        assert!(f.pool.is_empty());
        assert!(conn.is_closed());
        assert!(f.registry.find_by_id(conn.id()).is_none());
    }

    #[tokio::test]
    async fn clean_exit_does_not_restart() {
        let mut f = fixture(Mode::Register, PoolConfig::default());
        let (pid, _) = f.pool.get_free_process(1).await.unwrap();
        f.pool.register_unit(pid, "a", 1).unwrap();
        f.spawner.exit(pid, ExitOutcome::Exited(0));

        let event = f.events.recv().await.unwrap();
        assert!(matches!(event, PoolEvent::UnitFinished { exit: UnitExit::Exited(0), .. }));
        f.pool.stop_all(Duration::from_secs(1)).await;
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn finish_unit_frees_capacity() {
        let mut f = fixture(Mode::Register, PoolConfig::default());
        let (pid, _) = f.pool.get_free_process(40).await.unwrap();
        f.pool.register_unit(pid, "a", 40).unwrap();

        assert!(f.pool.finish_unit(pid, "a", UnitExit::Exited(0)));
        assert!(!f.pool.finish_unit(pid, "a", UnitExit::Exited(0)));
        assert!(f.pool.find_unit("a").is_none());
        let event = f.events.recv().await.unwrap();
        assert!(matches!(event, PoolEvent::UnitFinished { pid: p, .. } if p == pid));

        let (same, _) = f.pool.get_free_process(40).await.unwrap();
        assert_eq!(same, pid);
        assert!(f.pool.unregister_unit(pid, "a"));
        assert!(!f.pool.unregister_unit(pid, "a"));
    }

    #[tokio::test]
    async fn garbage_collection_keeps_one_warm_and_is_idempotent() {
        let config = PoolConfig {
            idle_grace: Duration::ZERO,
            ..PoolConfig::default()
        };
        let mut f = fixture(Mode::Register, config);

        let mut pids = Vec::new();
        for unit in ["a", "b", "c"] {
            let (pid, _) = f.pool.get_free_process(40).await.unwrap();
            f.pool.register_unit(pid, unit, 40).unwrap();
            pids.push(pid);
        }
        // One busy process and two idle, empty ones.
        f.pool.unregister_unit(pids[0], "a");
        f.pool.unregister_unit(pids[1], "b");

        assert_eq!(f.pool.collect_garbage(), 1);
        assert_eq!(f.pool.collect_garbage(), 0);

        // The stopped process leaves with a requested-stop outcome and no units.
        while f.pool.len() > 2 {
            tokio::task::yield_now().await;
        }
        assert!(f.pool.find_unit("c").is_some());
        assert!(f.events.try_recv().is_err());
        assert_eq!(f.pool.collect_garbage(), 0);
    }

    #[tokio::test]
    async fn stop_all_reports_stopped_units() {
        let mut f = fixture(Mode::Register, PoolConfig::default());
        let (pid, _) = f.pool.get_free_process(1).await.unwrap();
        f.pool.register_unit(pid, "a", 1).unwrap();

        assert!(f.pool.stop_all(Duration::from_secs(2)).await);
        assert_eq!(
            f.events.recv().await.unwrap(),
            PoolEvent::UnitFinished {
                unit_id: "a".to_string(),
                pid,
                exit: UnitExit::Stopped
            }
        );
    }

    #[tokio::test]
    async fn closed_connection_is_reclaimed_as_a_crash() {
        let mut f = fixture(Mode::Register, PoolConfig::default());
        let (pid, conn) = f.pool.get_free_process(1).await.unwrap();
        f.pool.register_unit(pid, "a", 1).unwrap();

        // The process is still alive but can no longer be reached.
        conn.close();
        assert_eq!(f.pool.collect_garbage(), 1);
        assert_eq!(f.pool.collect_garbage(), 0);

        assert_eq!(
            f.events.recv().await.unwrap(),
            PoolEvent::UnitFinished {
                unit_id: "a".to_string(),
                pid,
                exit: UnitExit::Lost
            }
        );
        assert_eq!(
            f.events.recv().await.unwrap(),
            PoolEvent::RestartRequested {
                pid,
                exit: UnitExit::Lost
            }
        );
        assert!(f.pool.is_empty());
    }

    #[tokio::test]
    async fn cost_near_the_integer_limit_does_not_overflow() {
        let config = PoolConfig {
            max_cost_per_process: u32::MAX,
            ..PoolConfig::default()
        };
        let f = fixture(Mode::Register, config);
        let (pid, _) = f.pool.get_free_process(u32::MAX).await.unwrap();
        f.pool.register_unit(pid, "big", u32::MAX).unwrap();

        let result = f.pool.register_unit(pid, "more", 1);
        assert!(matches!(result, Err(RpcError::Capacity { required: u32::MAX, .. })));

        // A full process is skipped; the next unit gets a process of its own.
        let (other, _) = f.pool.get_free_process(1).await.unwrap();
        assert_ne!(other, pid);
    }

    #[test]
    fn unit_exit_codes() {
        assert_eq!(UnitExit::Stopped.code(), EXIT_STOPPED);
        assert_eq!(UnitExit::Signaled(9).code(), EXIT_SIGNALED);
        assert_eq!(UnitExit::Exited(3).code(), 3);
        assert_eq!(UnitExit::from_code(EXIT_STOPPED), UnitExit::Stopped);
        assert_eq!(UnitExit::from_code(0), UnitExit::Exited(0));
        assert_eq!(UnitExit::from_code(EXIT_LOST), UnitExit::Lost);
        assert!(UnitExit::Lost.is_crash());
        assert!(!UnitExit::Stopped.is_crash());
    }
}
