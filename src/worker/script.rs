//! Script units: each unit is one external program run by the worker.
//!
//! The program is started with the unit's arguments and an optional time
//! limit. When it ends the worker reports `unitFinished(unitId, code)` to
//! the broker.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use super::{BrokerLink, WorkerClient};
use crate::connection::lock;
use crate::error::RpcError;
use crate::pool::EXIT_STOPPED;
use crate::router::handler_fn;
use crate::transport::Value;
use crate::units::{UnitSpec, START_UNIT, STOP_UNIT, UNIT_FINISHED};

/// Method every worker serves for liveness checks.
pub const PING: &str = "worker.ping";

/// Exit code reported when a unit hits its time limit.
pub const EXIT_TIMED_OUT: i32 = 124;

/// Runs script units for one worker process.
pub struct ScriptHost {
    link: BrokerLink,
    /// Stop signal per running unit.
    running: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl ScriptHost {
    /// Install the unit methods on `client`.
    ///
    /// Nothing is sent to the broker, so this runs before the
    /// `registerClient` handshake and the units can be started as soon as
    /// the broker sees the worker.
    pub fn install(client: &WorkerClient) -> Arc<Self> {
        let host = Arc::new(Self {
            link: client.link(),
            running: Arc::new(Mutex::new(HashMap::new())),
        });

        let weak = Arc::downgrade(&host);
        client.serve_local(
            START_UNIT,
            handler_fn(move |_ctx, args: Vec<Value>| {
                let host = weak.clone();
                async move {
                    let host = upgrade(&host)?;
                    let unit_id = args
                        .first()
                        .and_then(Value::as_str)
                        .ok_or_else(|| RpcError::invalid_params(START_UNIT, "expected unit id"))?;
                    let spec = UnitSpec::from_value(args.get(1).unwrap_or(&Value::Void))?;
                    host.start(unit_id, spec)?;
                    Ok(Value::Boolean(true))
                }
            }),
        );

        let weak = Arc::downgrade(&host);
        client.serve_local(
            STOP_UNIT,
            handler_fn(move |_ctx, args: Vec<Value>| {
                let host = weak.clone();
                async move {
                    let host = upgrade(&host)?;
                    let unit_id = args
                        .first()
                        .and_then(Value::as_str)
                        .ok_or_else(|| RpcError::invalid_params(STOP_UNIT, "expected unit id"))?;
                    host.stop(unit_id)?;
                    Ok(Value::Boolean(true))
                }
            }),
        );

        client.serve_local(
            UNIT_FINISHED,
            handler_fn(|_ctx, args: Vec<Value>| async move {
                let finished = Value::Array(args);
                debug!(args = %finished, "Unit finished elsewhere");
                Ok(Value::Void)
            }),
        );

        host
    }

    /// Announce `worker.ping`. Call after the worker registered.
    pub async fn announce(client: &WorkerClient) -> Result<(), RpcError> {
        client
            .register_method(PING, handler_fn(|_ctx, args| async move { Ok(Value::Array(args)) }))
            .await
    }

    /// Start `unit_id`; completion is reported to the broker.
    #[instrument(skip(self, spec), fields(exec = %spec.exec))]
    pub fn start(&self, unit_id: &str, spec: UnitSpec) -> Result<(), RpcError> {
        let mut running = lock(&self.running);
        if running.contains_key(unit_id) {
            return Err(RpcError::invalid_params(
                START_UNIT,
                format!("unit {unit_id} is already running"),
            ));
        }

        let mut child = Command::new(&spec.exec)
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RpcError::Spawn(format!("{}: {e}", spec.exec)))?;

        let (stop, mut stopped) = oneshot::channel();
        running.insert(unit_id.to_string(), stop);
        drop(running);
        info!(unit = unit_id, pid = ?child.id(), "Unit started");

        let limit = (spec.timeout_seconds > 0).then(|| Duration::from_secs(spec.timeout_seconds));
        let link = self.link.clone();
        let unit_id = unit_id.to_string();
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let deadline = async {
                match limit {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending().await,
                }
            };

            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status
                        .code()
                        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
                    Err(e) => {
                        warn!(unit = %unit_id, error = %e, "Failed to wait for unit");
                        -1
                    }
                },
                Ok(()) = &mut stopped => {
                    let _ = child.kill().await;
                    EXIT_STOPPED
                }
                () = deadline => {
                    warn!(unit = %unit_id, ?limit, "Unit timed out");
                    let _ = child.kill().await;
                    EXIT_TIMED_OUT
                }
            };

            // A unit restarted under the same id has a live receiver.
            drop(stopped);
            {
                let mut running = lock(&running);
                if running.get(&unit_id).is_some_and(oneshot::Sender::is_closed) {
                    running.remove(&unit_id);
                }
            }
            debug!(unit = %unit_id, code, "Unit ended");
            let args = [Value::from(unit_id.as_str()), Value::Integer(code)];
            match link.call(UNIT_FINISHED, &args).await {
                Ok(reply) if reply.is_fault() => warn!(unit = %unit_id, %reply, "Broker rejected unit completion"),
                Ok(_) => {}
                Err(e) => warn!(unit = %unit_id, error = %e, "Could not report unit completion"),
            }
        });
        Ok(())
    }

    /// Kill a running unit. It reports `unitFinished` with the stopped code.
    pub fn stop(&self, unit_id: &str) -> Result<(), RpcError> {
        let stop = lock(&self.running)
            .remove(unit_id)
            .ok_or_else(|| RpcError::UnknownUnit(unit_id.to_string()))?;
        let _ = stop.send(());
        Ok(())
    }

    /// Kill every unit.
    pub fn stop_all(&self) {
        for (_, stop) in lock(&self.running).drain() {
            let _ = stop.send(());
        }
    }
}

fn upgrade(host: &Weak<ScriptHost>) -> Result<Arc<ScriptHost>, RpcError> {
    host.upgrade().ok_or(RpcError::Shutdown)
}
