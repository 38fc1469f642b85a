//! ipc-broker daemon library
//!
//! Routes RPC calls between a broker and its worker processes over Unix
//! sockets:
//! - Binary frame codec and socket setup (`transport`)
//! - Connections, request/response correlation and the three-queue dispatcher
//! - Method router, connection registry and worker process pool
//! - The broker server and the worker-side client

pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod registry;
pub mod router;
pub mod server;
pub mod spawner;
pub mod transport;
pub mod units;
pub mod worker;
