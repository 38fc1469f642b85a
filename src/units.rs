//! Units: long-running jobs hosted by worker processes.
//!
//! The broker picks a process with enough spare capacity, records the unit
//! in the pool and tells the worker to start it. Completion comes back as a
//! `unitFinished` call or as the death of the hosting process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::lock;
use crate::correlator::Correlator;
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::pool::{PoolEvent, ProcessPool};
use crate::registry::ConnectionRegistry;
use crate::transport::Value;

/// Worker method that starts a unit.
pub const START_UNIT: &str = "startUnit";
/// Worker method that stops a unit.
pub const STOP_UNIT: &str = "stopUnit";
/// Completion report (worker to broker) and completion notice (broker to workers).
pub const UNIT_FINISHED: &str = "unitFinished";

/// What a worker runs for a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    /// Program to execute.
    pub exec: String,
    /// Arguments passed to `exec`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Capacity the unit takes on its process.
    #[serde(default = "default_cost")]
    pub cost: u32,
    /// Kill the unit after this many seconds. 0 disables the limit.
    #[serde(default)]
    pub timeout_seconds: u64,
}

const fn default_cost() -> u32 {
    1
}

impl UnitSpec {
    /// Encode as an RPC struct with camelCase keys.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).map_or(Value::Void, Value::from)
    }

    /// Decode from `startUnit` arguments.
    pub fn from_value(value: &Value) -> Result<Self, RpcError> {
        serde_json::from_value(value.to_json())
            .map_err(|e| RpcError::invalid_params(START_UNIT, e.to_string()))
    }
}

/// Starts, stops and restarts units on pool processes.
pub struct UnitManager {
    pool: Arc<ProcessPool>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    correlator: Arc<Correlator>,
    /// Specs of running units.
    running: Mutex<HashMap<String, UnitSpec>>,
    /// Specs of units lost with a crashed process, waiting for a restart.
    crashed: Mutex<HashMap<String, UnitSpec>>,
    /// Held from process selection until the unit is recorded.
    start_lock: tokio::sync::Mutex<()>,
}

impl UnitManager {
    /// Manager over `pool`; completions are broadcast through `dispatcher`.
    pub fn new(
        pool: Arc<ProcessPool>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<Dispatcher>,
        correlator: Arc<Correlator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry,
            dispatcher,
            correlator,
            running: Mutex::new(HashMap::new()),
            crashed: Mutex::new(HashMap::new()),
            start_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Start `unit_id` on a process with room for it. Returns the pid.
    pub async fn start_unit(&self, unit_id: &str, spec: UnitSpec) -> Result<u32, RpcError> {
        let (pid, conn) = {
            let _guard = self.start_lock.lock().await;
            if self.pool.find_unit(unit_id).is_some() {
                return Err(RpcError::invalid_params(
                    START_UNIT,
                    format!("unit {unit_id} is already running"),
                ));
            }
            let (pid, conn) = self.pool.get_free_process(spec.cost).await?;
            self.pool.register_unit(pid, unit_id, spec.cost)?;
            (pid, conn)
        };
        lock(&self.running).insert(unit_id.to_string(), spec.clone());

        let args = [Value::from(unit_id), spec.to_value()];
        let started = self
            .correlator
            .send_request(&conn, START_UNIT, &args, true)
            .await
            .and_then(RpcError::check);
        match started {
            Ok(_) => {
                info!(unit = unit_id, pid, cost = spec.cost, "Unit started");
                Ok(pid)
            }
            Err(e) => {
                warn!(unit = unit_id, pid, error = %e, "Unit failed to start");
                self.pool.unregister_unit(pid, unit_id);
                lock(&self.running).remove(unit_id);
                Err(e)
            }
        }
    }

    /// Ask the owning worker to stop `unit_id`. It will not be restarted.
    pub async fn stop_unit(&self, unit_id: &str) -> Result<(), RpcError> {
        lock(&self.crashed).remove(unit_id);
        let Some((pid, conn)) = self.pool.find_unit(unit_id) else {
            return Err(RpcError::UnknownUnit(unit_id.to_string()));
        };
        lock(&self.running).remove(unit_id);
        let conn = conn.ok_or(RpcError::UnknownProcess(pid))?;
        self.correlator
            .send_request(&conn, STOP_UNIT, &[Value::from(unit_id)], true)
            .await
            .and_then(RpcError::check)?;
        debug!(unit = unit_id, pid, "Stop requested");
        Ok(())
    }

    /// Running units and their pids, sorted by unit id.
    pub fn list_units(&self) -> Vec<(String, u32)> {
        let mut units: Vec<(String, u32)> = self
            .pool
            .processes()
            .into_iter()
            .flat_map(|info| info.units.into_iter().map(move |unit| (unit, info.pid)))
            .collect();
        units.sort();
        units
    }

    /// Consume pool events until the pool goes away.
    pub fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<PoolEvent>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_event(event).await;
            }
        })
    }

    async fn handle_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::UnitFinished { unit_id, pid, exit } => {
                self.pool.unregister_unit(pid, &unit_id);
                let spec = lock(&self.running).remove(&unit_id);
                if let Some(spec) = spec.filter(|_| exit.is_crash() && self.pool.config().restart_on_crash) {
                    lock(&self.crashed).insert(unit_id.clone(), spec);
                }
                let args = vec![Value::from(unit_id.as_str()), Value::Integer(exit.code())];
                let notified = self
                    .dispatcher
                    .broadcast(self.registry.open_connections(), UNIT_FINISHED, args);
                debug!(unit = %unit_id, pid, code = exit.code(), notified, "Unit completion broadcast");
            }
            PoolEvent::RestartRequested { pid, exit } => {
                warn!(pid, ?exit, "Worker crashed, restarting units");
                self.restart_crashed().await;
            }
        }
    }

    /// Start every unit lost in a crash again. Returns how many came back.
    pub async fn restart_crashed(&self) -> usize {
        let crashed: Vec<(String, UnitSpec)> = lock(&self.crashed).drain().collect();
        let mut restarted = 0;
        for (unit_id, spec) in crashed {
            match self.start_unit(&unit_id, spec).await {
                Ok(pid) => {
                    info!(unit = %unit_id, pid, "Unit restarted");
                    restarted += 1;
                }
                Err(e) => warn!(unit = %unit_id, error = %e, "Unit restart failed"),
            }
        }
        restarted
    }
}
