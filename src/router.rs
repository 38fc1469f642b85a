//! Method registry and router.
//!
//! A method name resolves to a local handler, to the set of connections
//! that registered it, or to nothing. Local handlers win over remote
//! registrations of the same name.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::connection::{lock, Connection};
use crate::correlator::Correlator;
use crate::dispatcher::RequestHandler;
use crate::error::RpcError;
use crate::transport::Value;

/// Worker-side call that declares a method it serves.
pub const REGISTER_RPC_METHOD: &str = "registerRpcMethod";
/// Introspection: all known method names.
pub const LIST_METHODS: &str = "system.listMethods";
/// Introspection: signatures registered for a method.
pub const METHOD_SIGNATURE: &str = "system.methodSignature";

/// Who is calling.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// The connection the request arrived on; `None` for in-process callers.
    pub caller: Option<Arc<Connection>>,
}

impl CallContext {
    /// Pid of the calling process, if it registered.
    pub fn caller_pid(&self) -> Option<u32> {
        self.caller.as_ref().and_then(|conn| conn.pid())
    }
}

/// A locally implemented method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> Result<Value, RpcError>;

    /// Signatures for introspection, each `[return type, param types...]`.
    fn signatures(&self) -> Vec<Value> {
        Vec::new()
    }
}

/// Adapter turning an async closure into a [`MethodHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send,
{
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> Result<Value, RpcError> {
        (self.0)(ctx, args).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Result of resolving a method name.
#[derive(Clone)]
pub enum Route {
    Local(Arc<dyn MethodHandler>),
    Remote(Vec<Arc<Connection>>),
    Unknown,
}

struct RemoteServer {
    conn: Arc<Connection>,
    signatures: Vec<Value>,
}

/// Routes method calls to local handlers or registered workers.
pub struct MethodRouter {
    local: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
    remote: Mutex<HashMap<String, BTreeMap<u64, RemoteServer>>>,
    correlator: Arc<Correlator>,
}

impl MethodRouter {
    /// Router forwarding remote calls through `correlator`.
    pub fn new(correlator: Arc<Correlator>) -> Arc<Self> {
        Arc::new(Self {
            local: RwLock::new(HashMap::new()),
            remote: Mutex::new(HashMap::new()),
            correlator,
        })
    }

    /// Register (or replace) a local handler.
    pub fn register_local(&self, name: &str, handler: Arc<dyn MethodHandler>) {
        let mut local = self.local.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if local.insert(name.to_string(), handler).is_some() {
            debug!(method = name, "Replaced local handler");
        }
    }

    /// Add `conn` to the servers of `name`. Returns the new server count.
    pub fn register_remote(&self, conn: &Arc<Connection>, name: &str, signatures: Vec<Value>) -> usize {
        let mut remote = lock(&self.remote);
        let servers = remote.entry(name.to_string()).or_default();
        servers.insert(
            conn.id(),
            RemoteServer {
                conn: Arc::clone(conn),
                signatures,
            },
        );
        let count = servers.len();
        info!(method = name, conn = conn.id(), pid = ?conn.pid(), servers = count, "Registered RPC method");
        count
    }

    /// Drop `conn_id` from every method, deleting methods left without servers.
    pub fn unregister_connection(&self, conn_id: u64) -> usize {
        let mut remote = lock(&self.remote);
        let mut removed = 0;
        remote.retain(|name, servers| {
            if servers.remove(&conn_id).is_some() {
                removed += 1;
                debug!(method = %name, conn = conn_id, remaining = servers.len(), "Unregistered RPC method");
            }
            !servers.is_empty()
        });
        removed
    }

    /// Where a call to `name` would go. Local handlers win.
    pub fn resolve(&self, name: &str) -> Route {
        if let Some(handler) = self
            .local
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
        {
            return Route::Local(Arc::clone(handler));
        }
        match lock(&self.remote).get(name) {
            Some(servers) if !servers.is_empty() => {
                Route::Remote(servers.values().map(|s| Arc::clone(&s.conn)).collect())
            }
            _ => Route::Unknown,
        }
    }

    /// Sorted list of every local and remote method name.
    pub fn list_methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .local
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.extend(lock(&self.remote).keys().cloned());
        names.extend([REGISTER_RPC_METHOD, LIST_METHODS, METHOD_SIGNATURE].map(String::from));
        names.sort();
        names.dedup();
        names
    }

    /// Signatures known for `name`, or `None` if nobody serves it.
    pub fn signatures(&self, name: &str) -> Option<Vec<Value>> {
        match self.resolve(name) {
            Route::Local(handler) => Some(handler.signatures()),
            Route::Remote(_) => lock(&self.remote).get(name).map(|servers| {
                servers
                    .values()
                    .flat_map(|s| s.signatures.iter().cloned())
                    .collect()
            }),
            Route::Unknown => None,
        }
    }

    /// Call `name` from inside the broker process.
    ///
    /// Never fails: mechanism errors come back as fault values.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Value {
        self.dispatch(CallContext::default(), name, args)
            .await
            .unwrap_or_else(RpcError::into_fault)
    }

    /// Route one call.
    pub async fn dispatch(&self, ctx: CallContext, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match name {
            REGISTER_RPC_METHOD => return self.register_from_request(&ctx, args),
            LIST_METHODS => {
                return Ok(Value::Array(
                    self.list_methods().into_iter().map(Value::String).collect(),
                ))
            }
            METHOD_SIGNATURE => {
                let method = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::invalid_params(name, "expected method name"))?;
                return self
                    .signatures(method)
                    .map(Value::Array)
                    .ok_or_else(|| RpcError::UnknownMethod(method.to_string()));
            }
            _ => {}
        }

        match self.resolve(name) {
            Route::Local(handler) => handler.call(ctx, args).await,
            Route::Remote(mut servers) if servers.len() == 1 => {
                let conn = servers.remove(0);
                self.correlator.send_request(&conn, name, &args, true).await
            }
            Route::Remote(servers) => Ok(self.call_all(servers, name, args).await),
            Route::Unknown => Err(RpcError::UnknownMethod(name.to_string())),
        }
    }

    /// Forward to several servers at once; results keyed by connection id.
    async fn call_all(&self, servers: Vec<Arc<Connection>>, name: &str, args: Vec<Value>) -> Value {
        let args = Arc::new(args);
        let mut calls = JoinSet::new();
        for conn in servers {
            let correlator = Arc::clone(&self.correlator);
            let args = Arc::clone(&args);
            let name = name.to_string();
            calls.spawn(async move {
                let result = correlator
                    .send_request(&conn, &name, &args, true)
                    .await
                    .unwrap_or_else(RpcError::into_fault);
                (conn.id(), result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((conn_id, value)) => {
                    results.insert(conn_id.to_string(), value);
                }
                Err(e) => warn!(method = name, error = %e, "Forwarded call task failed"),
            }
        }
        Value::Struct(results)
    }

    fn register_from_request(&self, ctx: &CallContext, args: Vec<Value>) -> Result<Value, RpcError> {
        let conn = ctx
            .caller
            .as_ref()
            .ok_or_else(|| RpcError::invalid_params(REGISTER_RPC_METHOD, "only connected peers can serve methods"))?;
        let mut args = args.into_iter();
        let name = match args.next() {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => return Err(RpcError::invalid_params(REGISTER_RPC_METHOD, "expected method name")),
        };
        let signatures = match args.next() {
            Some(Value::Array(signatures)) => signatures,
            None | Some(Value::Void) => Vec::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    REGISTER_RPC_METHOD,
                    "signatures must be an array",
                ))
            }
        };
        self.register_remote(conn, &name, signatures);
        Ok(Value::Boolean(true))
    }
}

#[async_trait]
impl RequestHandler for MethodRouter {
    async fn handle_request(&self, conn: &Arc<Connection>, method: &str, args: Vec<Value>) -> Value {
        let ctx = CallContext {
            caller: Some(Arc::clone(conn)),
        };
        self.dispatch(ctx, method, args).await.unwrap_or_else(|e| {
            debug!(conn = conn.id(), pid = ?conn.pid(), method, error = %e, "Call failed");
            e.into_fault()
        })
    }
}
