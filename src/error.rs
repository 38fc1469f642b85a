//! Error types for the codec and the RPC mechanism.
//!
//! Nothing crosses the public call boundary as a Rust error: `RpcError`
//! values are turned into fault values with [`RpcError::into_fault`] before
//! they reach a caller of the router.

use std::time::Duration;

use thiserror::Error;

use crate::transport::protocol::Value;

/// Fault code for a method nobody serves.
pub const FAULT_UNKNOWN_METHOD: i32 = -32601;
/// Fault code for malformed call arguments.
pub const FAULT_INVALID_PARAMS: i32 = -32602;
/// Fault code for internal failures.
pub const FAULT_INTERNAL: i32 = -32603;
/// Fault code for a request whose response never arrived.
pub const FAULT_NO_RESPONSE: i32 = -32500;
/// Fault code for socket read/write failures.
pub const FAULT_TRANSPORT: i32 = -32501;
/// Fault code for process creation or handshake failures.
pub const FAULT_SPAWN: i32 = -32502;
/// Fault code for capacity rejections.
pub const FAULT_CAPACITY: i32 = -32503;
/// Fault code for calls made while the broker shuts down.
pub const FAULT_SHUTDOWN: i32 = -32504;
/// Fault code for frames that could not be decoded.
pub const FAULT_PROTOCOL: i32 = -32505;

/// A frame that could not be decoded.
///
/// Recoverable: the reader discards the connection's partial frame and
/// keeps the connection open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer ended before the frame did.
    #[error("Truncated frame: needed {needed} more bytes")]
    Truncated { needed: usize },

    /// The frame did not start with the `Bin` marker.
    #[error("Bad frame magic: {0:02x?}")]
    BadMagic([u8; 3]),

    /// Unknown frame type byte.
    #[error("Unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    /// Unknown value type tag.
    #[error("Unknown value type 0x{0:x}")]
    UnknownValueType(u32),

    /// Length header above the frame size limit.
    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Containers nested deeper than the decoder allows.
    #[error("Value nesting exceeds {0} levels")]
    NestingTooDeep(usize),

    /// A string field was not valid UTF-8.
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Bytes left over after the declared frame content.
    #[error("{0} trailing bytes after frame content")]
    TrailingBytes(usize),

    /// A fault frame without the faultCode/faultString struct.
    #[error("Malformed fault payload")]
    MalformedFault,
}

/// Failures of the RPC mechanism itself.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Undecodable frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket read or write failed; the connection is closed.
    #[error("Transport error on connection {conn}: {source}")]
    Transport {
        conn: u64,
        #[source]
        source: std::io::Error,
    },

    /// The connection closed before the response arrived.
    #[error("No response received from connection {conn} for {method}")]
    NoResponse { conn: u64, method: String },

    /// Sending on a connection that is already closed.
    #[error("Connection {0} is closed")]
    ConnectionClosed(u64),

    /// Nobody serves this method.
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Arguments did not match what the method expects.
    #[error("Invalid parameters for {method}: {reason}")]
    InvalidParams { method: String, reason: String },

    /// Process creation failed.
    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    /// A spawned process never completed its registration handshake.
    #[error("Worker process {pid} did not register within {timeout:?}")]
    SpawnTimeout { pid: u32, timeout: Duration },

    /// The request can never be satisfied by a single process.
    #[error("Required capacity {required} exceeds per-process limit {limit}")]
    Capacity { required: u32, limit: u32 },

    /// Connection cap reached.
    #[error("Too many connections (limit {0})")]
    TooManyConnections(usize),

    /// A peer answered with a fault.
    #[error("Remote fault {code}: {message}")]
    Fault { code: i32, message: String },

    /// No pool entry for this pid.
    #[error("No worker process with pid {0}")]
    UnknownProcess(u32),

    /// Unknown unit id.
    #[error("Unit {0} is not running")]
    UnknownUnit(String),

    /// The broker is shutting down.
    #[error("Shutdown requested")]
    Shutdown,
}

impl RpcError {
    /// Shorthand for [`RpcError::InvalidParams`].
    pub fn invalid_params(method: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            method: method.to_string(),
            reason: reason.into(),
        }
    }

    /// Fault code used when this error is turned into a fault value.
    pub const fn fault_code(&self) -> i32 {
        match self {
            Self::Protocol(_) => FAULT_PROTOCOL,
            Self::Transport { .. } => FAULT_TRANSPORT,
            Self::NoResponse { .. } | Self::ConnectionClosed(_) => FAULT_NO_RESPONSE,
            Self::UnknownMethod(_) => FAULT_UNKNOWN_METHOD,
            Self::InvalidParams { .. } => FAULT_INVALID_PARAMS,
            Self::Spawn(_) | Self::SpawnTimeout { .. } => FAULT_SPAWN,
            Self::Capacity { .. } | Self::TooManyConnections(_) => FAULT_CAPACITY,
            Self::UnknownUnit(_) | Self::UnknownProcess(_) => FAULT_INTERNAL,
            Self::Shutdown => FAULT_SHUTDOWN,
            Self::Fault { code, .. } => *code,
        }
    }

    /// Render as a fault value. Remote faults keep their code.
    pub fn into_fault(self) -> Value {
        match self {
            Self::Fault { code, message } => Value::fault(code, message),
            other => Value::fault(other.fault_code(), other.to_string()),
        }
    }

    /// Turn a fault value into `Err`, pass anything else through.
    pub fn check(value: Value) -> Result<Value, Self> {
        match (value.fault_code(), value.fault_string()) {
            (Some(code), Some(message)) => Err(Self::Fault {
                code,
                message: message.to_string(),
            }),
            _ => Ok(value),
        }
    }
}
