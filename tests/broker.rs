//! End-to-end tests: a broker on a real Unix socket with in-process workers,
//! plus one test against the real `ipc-broker worker` binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use ipc_broker_daemon::config::BrokerConfig;
use ipc_broker_daemon::error::{FAULT_CAPACITY, FAULT_NO_RESPONSE, FAULT_UNKNOWN_METHOD};
use ipc_broker_daemon::pool::{EXIT_SIGNALED, EXIT_STOPPED};
use ipc_broker_daemon::router::{handler_fn, LIST_METHODS};
use ipc_broker_daemon::server::{Broker, LIST_UNITS};
use ipc_broker_daemon::spawner::{ChildProcess, CommandSpawner, ExitOutcome, ProcessSpawner, SpawnedProcess};
use ipc_broker_daemon::transport::Value;
use ipc_broker_daemon::units::{UnitSpec, START_UNIT, STOP_UNIT, UNIT_FINISHED};
use ipc_broker_daemon::worker::{ScriptHost, WorkerClient};

const WAIT: Duration = Duration::from_secs(10);

/// Fast timings that still satisfy the configuration ordering rules.
fn fast_config(dir: &Path) -> BrokerConfig {
    let mut config = BrokerConfig::from_json(
        r#"{
            "spawn_timeout_seconds": 1,
            "wait_slice_ms": 100,
            "warn_after_slices": 20,
            "idle_grace_seconds": 2
        }"#,
    )
    .unwrap();
    config.socket_path = dir.join("broker.sock");
    config
}

async fn start_broker(config: BrokerConfig, spawner: Arc<dyn ProcessSpawner>) -> (Arc<Broker>, JoinHandle<()>) {
    let broker = Broker::new(config, spawner).unwrap();
    let listener = broker.bind().unwrap();
    let serving = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.serve(listener).await })
    };
    (broker, serving)
}

/// A worker connected directly, without going through the pool.
async fn direct_worker(broker: &Broker, pid: u32) -> WorkerClient {
    let client = WorkerClient::connect(broker.socket_path(), pid).await.unwrap();
    client.register_client().await.unwrap();
    client
}

/// A connection that records every `unitFinished` notice.
async fn observer(broker: &Broker) -> (WorkerClient, mpsc::UnboundedReceiver<(String, i32)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = WorkerClient::connect(broker.socket_path(), 1).await.unwrap();
    client.serve_local(
        UNIT_FINISHED,
        handler_fn(move |_ctx, args: Vec<Value>| {
            let tx = tx.clone();
            async move {
                let unit = args[0].as_str().unwrap().to_string();
                let code = args[1].as_i32().unwrap();
                let _ = tx.send((unit, code));
                Ok(Value::Void)
            }
        }),
    );
    (client, rx)
}

async fn finished(rx: &mut mpsc::UnboundedReceiver<(String, i32)>, unit: &str) -> i32 {
    tokio::time::timeout(WAIT, async {
        loop {
            let (id, code) = rx.recv().await.unwrap();
            if id == unit {
                return code;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no unitFinished for {unit}"))
}

fn sh(script: &str, cost: u32) -> Value {
    UnitSpec {
        exec: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        cost,
        timeout_seconds: 0,
    }
    .to_value()
}

fn units(listed: &Value) -> HashMap<String, i64> {
    listed
        .as_struct()
        .unwrap()
        .iter()
        .map(|(unit, pid)| (unit.clone(), pid.as_i64().unwrap()))
        .collect()
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

// In-process worker processes

struct InProcessChild {
    task: JoinHandle<()>,
    crash: oneshot::Receiver<i32>,
    killed: bool,
}

#[async_trait]
impl ChildProcess for InProcessChild {
    async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        if self.killed {
            let _ = (&mut self.task).await;
            return Ok(ExitOutcome::Signaled(9));
        }
        tokio::select! {
            _ = &mut self.task => Ok(ExitOutcome::Exited(0)),
            Ok(signal) = &mut self.crash => {
                self.task.abort();
                Ok(ExitOutcome::Signaled(signal))
            }
        }
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.killed = true;
        self.task.abort();
        Ok(())
    }
}

/// Runs each "process" as a task hosting a script worker.
#[derive(Default)]
struct InProcessSpawner {
    next_pid: AtomicU32,
    crashes: Mutex<HashMap<u32, oneshot::Sender<i32>>>,
}

impl InProcessSpawner {
    fn crash(&self, pid: u32, signal: i32) {
        let tx = self.crashes.lock().unwrap().remove(&pid).unwrap();
        tx.send(signal).unwrap();
    }
}

#[async_trait]
impl ProcessSpawner for InProcessSpawner {
    async fn spawn(&self, socket_path: &Path) -> anyhow::Result<SpawnedProcess> {
        let pid = 900_000 + self.next_pid.fetch_add(1, Ordering::Relaxed);
        let socket: PathBuf = socket_path.to_path_buf();
        let task = tokio::spawn(async move {
            let client = WorkerClient::connect(&socket, pid).await.unwrap();
            let host = ScriptHost::install(&client);
            client.register_client().await.unwrap();
            ScriptHost::announce(&client).await.unwrap();
            client.closed().await;
            host.stop_all();
        });
        let (tx, crash) = oneshot::channel();
        self.crashes.lock().unwrap().insert(pid, tx);
        Ok(SpawnedProcess {
            pid,
            child: Box::new(InProcessChild {
                task,
                crash,
                killed: false,
            }),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registered_method_receives_arguments_and_returns_result() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _serving) = start_broker(fast_config(dir.path()), Arc::new(InProcessSpawner::default())).await;

    let worker = direct_worker(&broker, 4242).await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    worker
        .register_method(
            "foo",
            handler_fn(move |_ctx, args: Vec<Value>| {
                let seen = seen_tx.clone();
                async move {
                    let _ = seen.send(args.clone());
                    let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                    Ok(Value::structure([("sum", Value::Integer64(sum))]))
                }
            }),
        )
        .await
        .unwrap();

    let result = broker.call("foo", vec![Value::Integer(1), Value::Integer(2)]).await;
    assert_eq!(seen_rx.recv().await.unwrap(), vec![Value::Integer(1), Value::Integer(2)]);
    assert_eq!(result, Value::structure([("sum", Value::Integer64(3))]));

    let Value::Array(methods) = broker.call(LIST_METHODS, vec![]).await else {
        panic!("expected array");
    };
    assert!(methods.contains(&Value::from("foo")));

    // Worker to worker through the broker.
    let other = direct_worker(&broker, 4343).await;
    let via_broker = other.call("foo", &[Value::Integer(5)]).await.unwrap();
    assert_eq!(via_broker, Value::structure([("sum", Value::Integer64(5))]));

    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multiple_owners_are_aggregated() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _serving) = start_broker(fast_config(dir.path()), Arc::new(InProcessSpawner::default())).await;

    let mut workers = Vec::new();
    for pid in [10_u32, 20] {
        let worker = direct_worker(&broker, pid).await;
        worker
            .register_method(
                "node.describe",
                handler_fn(move |_ctx, _args| async move { Ok(Value::from(pid)) }),
            )
            .await
            .unwrap();
        workers.push(worker);
    }

    let result = broker.call("node.describe", vec![]).await;
    let members = result.as_struct().unwrap();
    assert_eq!(members.len(), 2);
    let mut pids: Vec<i64> = members.values().filter_map(Value::as_i64).collect();
    pids.sort_unstable();
    assert_eq!(pids, vec![10, 20]);

    // Closing one owner leaves a single server whose result is returned as is.
    let first = workers.remove(0);
    drop(first);
    let broker_ref = Arc::clone(&broker);
    wait_until(move || broker_ref.registry().len() == 1).await;
    assert_eq!(broker.call("node.describe", vec![]).await, Value::Integer(20));

    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_a_connection_unblocks_waiting_callers() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _serving) = start_broker(fast_config(dir.path()), Arc::new(InProcessSpawner::default())).await;

    let worker = direct_worker(&broker, 77).await;
    worker
        .register_method(
            "hang",
            handler_fn(|_ctx, _args| async { std::future::pending::<Result<Value, _>>().await }),
        )
        .await
        .unwrap();

    let call = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.call("hang", vec![]).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    worker.close();

    let result = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("caller must be released")
        .unwrap();
    assert_eq!(result.fault_code(), Some(FAULT_NO_RESPONSE));

    let broker_ref = Arc::clone(&broker);
    wait_until(move || broker_ref.registry().is_empty()).await;
    assert_eq!(broker.call("hang", vec![]).await.fault_code(), Some(FAULT_UNKNOWN_METHOD));

    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thousand_concurrent_calls_over_ten_connections() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _serving) = start_broker(fast_config(dir.path()), Arc::new(InProcessSpawner::default())).await;

    let mut workers = Vec::new();
    for n in 0..10_u32 {
        let worker = direct_worker(&broker, 100 + n).await;
        worker
            .register_method(
                &format!("echo.{n}"),
                handler_fn(|_ctx, args| async move { Ok(Value::Array(args)) }),
            )
            .await
            .unwrap();
        workers.push(worker);
    }

    let calls: Vec<_> = (0..1000_i32)
        .map(|i| {
            let broker = Arc::clone(&broker);
            let payload = Value::Binary(vec![u8::try_from(i % 251).unwrap(); 512]);
            tokio::spawn(async move {
                let method = format!("echo.{}", i % 10);
                let result = broker.call(&method, vec![Value::Integer(i), payload.clone()]).await;
                (i, payload, result)
            })
        })
        .collect();

    let all = tokio::time::timeout(Duration::from_secs(30), async {
        let mut done = Vec::new();
        for call in calls {
            done.push(call.await.unwrap());
        }
        done
    })
    .await
    .expect("every call completes");

    assert_eq!(all.len(), 1000);
    for (i, payload, result) in all {
        // A frame with interleaved bytes would not decode to this exact value.
        assert_eq!(result, Value::Array(vec![Value::Integer(i), payload]));
    }

    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn units_run_on_pool_processes_and_report_completion() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _serving) = start_broker(fast_config(dir.path()), Arc::new(InProcessSpawner::default())).await;
    let (_observer, mut events) = observer(&broker).await;

    // Finishes on its own.
    let pid = broker.call(START_UNIT, vec![Value::from("quick"), sh("exit 3", 5)]).await;
    assert!(pid.as_i64().is_some(), "{pid}");
    assert_eq!(finished(&mut events, "quick").await, 3);

    // Stopped on request.
    let pid = broker.call(START_UNIT, vec![Value::from("long"), sh("sleep 30", 5)]).await;
    let listed = units(&broker.call(LIST_UNITS, vec![]).await);
    assert_eq!(listed.get("long"), pid.as_i64().as_ref());
    assert_eq!(broker.call(STOP_UNIT, vec![Value::from("long")]).await, Value::Boolean(true));
    assert_eq!(finished(&mut events, "long").await, EXIT_STOPPED);

    // Timed out.
    let spec = UnitSpec {
        exec: "/bin/sleep".to_string(),
        args: vec!["30".to_string()],
        cost: 1,
        timeout_seconds: 1,
    };
    broker.call(START_UNIT, vec![Value::from("slow"), spec.to_value()]).await;
    assert_eq!(finished(&mut events, "slow").await, 124);

    // A start that can never fit is refused without spawning.
    let processes = broker.pool().len();
    let refused = broker.call(START_UNIT, vec![Value::from("huge"), sh("true", 41)]).await;
    assert_eq!(refused.fault_code(), Some(FAULT_CAPACITY));
    assert_eq!(broker.pool().len(), processes);

    let broker_ref = Arc::clone(&broker);
    wait_until(move || broker_ref.units().list_units().is_empty()).await;
    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_starts_that_fill_every_request_worker_still_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());
    let workers_per_queue = config.dispatcher.workers_per_queue;
    let (broker, _serving) = start_broker(config, Arc::new(InProcessSpawner::default())).await;

    // One caller per request worker, each start needing a fresh process.
    let mut callers = Vec::new();
    for n in 0..workers_per_queue {
        callers.push(direct_worker(&broker, 500 + u32::try_from(n).unwrap()).await);
    }
    let starts: Vec<_> = callers
        .into_iter()
        .enumerate()
        .map(|(n, caller)| {
            tokio::spawn(async move {
                let result = caller
                    .call(START_UNIT, &[Value::from(format!("remote{n}")), sh("sleep 30", 40)])
                    .await
                    .unwrap();
                (caller, result)
            })
        })
        .collect();

    let mut callers = Vec::new();
    for start in starts {
        let (caller, pid) = tokio::time::timeout(WAIT, start).await.unwrap().unwrap();
        assert!(pid.as_i64().is_some(), "{pid}");
        callers.push(caller);
    }
    assert_eq!(broker.pool().len(), workers_per_queue);
    assert_eq!(broker.units().list_units().len(), workers_per_queue);

    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_is_never_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _serving) = start_broker(fast_config(dir.path()), Arc::new(InProcessSpawner::default())).await;

    let starts: Vec<_> = (0..6)
        .map(|n| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .call(START_UNIT, vec![Value::from(format!("u{n}")), sh("sleep 30", 15)])
                    .await
            })
        })
        .collect();
    for start in starts {
        let pid = start.await.unwrap();
        assert!(pid.as_i64().is_some(), "{pid}");
    }

    // 15 + 15 fits in 40, a third does not: six units need three processes.
    let processes = broker.pool().processes();
    assert_eq!(processes.len(), 3);
    for process in processes {
        assert!(process.cost <= 40, "{process:?}");
    }

    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn garbage_collection_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _serving) = start_broker(fast_config(dir.path()), Arc::new(InProcessSpawner::default())).await;
    let (_observer, mut events) = observer(&broker).await;

    for unit in ["a", "b", "c"] {
        let pid = broker.call(START_UNIT, vec![Value::from(unit), sh("sleep 30", 40)]).await;
        assert!(pid.as_i64().is_some(), "{pid}");
    }
    assert_eq!(broker.pool().len(), 3);

    for unit in ["a", "b"] {
        broker.call(STOP_UNIT, vec![Value::from(unit)]).await;
        assert_eq!(finished(&mut events, unit).await, EXIT_STOPPED);
    }

    // Let both empty processes pass the idle grace period.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(broker.collect_garbage(), 1);
    assert_eq!(broker.collect_garbage(), 0);

    let broker_ref = Arc::clone(&broker);
    wait_until(move || broker_ref.pool().len() == 2).await;
    assert_eq!(broker.collect_garbage(), 0);
    assert!(broker.pool().find_unit("c").is_some());

    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_process_units_are_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let spawner = Arc::new(InProcessSpawner::default());
    let (broker, _serving) = start_broker(fast_config(dir.path()), spawner.clone()).await;
    let (_observer, mut events) = observer(&broker).await;

    let pid = broker.call(START_UNIT, vec![Value::from("flow"), sh("sleep 30", 1)]).await;
    let pid = u32::try_from(pid.as_i64().unwrap()).unwrap();

    spawner.crash(pid, 9);
    assert_eq!(finished(&mut events, "flow").await, EXIT_SIGNALED);
    assert!(broker.registry().find_by_pid(pid).is_none());

    let broker_ref = Arc::clone(&broker);
    wait_until(move || {
        broker_ref
            .pool()
            .find_unit("flow")
            .is_some_and(|(new_pid, _)| new_pid != pid)
    })
    .await;

    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sigkilled_worker_binary_finishes_its_units() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = BrokerConfig::from_json(
        r#"{
            "spawn_timeout_seconds": 10,
            "wait_slice_ms": 200,
            "warn_after_slices": 60,
            "idle_grace_seconds": 12,
            "restart_on_crash": false
        }"#,
    )
    .unwrap();
    config.socket_path = dir.path().join("broker.sock");
    let exe = PathBuf::from(env!("CARGO_BIN_EXE_ipc-broker"));
    let spawner = CommandSpawner::new(exe, vec!["worker".to_string()]).with_log_level("warn");
    let (broker, _serving) = start_broker(config, Arc::new(spawner)).await;
    let (_observer, mut events) = observer(&broker).await;

    let pid = broker.call(START_UNIT, vec![Value::from("sleepy"), sh("sleep 5", 1)]).await;
    let pid = pid.as_i64().unwrap_or_else(|| panic!("start failed: {pid}"));

    // The worker announces ping right after its handshake.
    let broker_ref = Arc::clone(&broker);
    wait_until(move || broker_ref.router().list_methods().iter().any(|m| m == "worker.ping")).await;
    let pong = broker.call("worker.ping", vec![Value::from("hi")]).await;
    assert_eq!(pong, Value::Array(vec![Value::from("hi")]));

    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    assert_eq!(finished(&mut events, "sleepy").await, EXIT_SIGNALED);
    let pid = u32::try_from(pid).unwrap();
    assert!(broker.registry().find_by_pid(pid).is_none());
    assert!(broker.pool().find_unit("sleepy").is_none());
    assert!(broker.pool().is_empty());

    broker.stop().await;
}
