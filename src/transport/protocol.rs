//! RPC value and frame types.
//!
//! Frames are binary: `Bin` marker, type byte, body length, then a packet id,
//! flags and the payload. See [`super::encode_request`] for the byte layout.

use std::collections::BTreeMap;
use std::fmt;

/// Struct member holding a fault's numeric code.
pub const FAULT_CODE_KEY: &str = "faultCode";
/// Struct member holding a fault's message.
pub const FAULT_STRING_KEY: &str = "faultString";

/// A self-describing RPC value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Void,
    Integer(i32),
    Integer64(i64),
    Boolean(bool),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    /// Build a fault value (`{faultCode, faultString}`).
    pub fn fault(code: i32, message: impl Into<String>) -> Self {
        let mut members = BTreeMap::new();
        members.insert(FAULT_CODE_KEY.to_string(), Self::Integer(code));
        members.insert(FAULT_STRING_KEY.to_string(), Self::String(message.into()));
        Self::Struct(members)
    }

    /// Build a struct from key/value pairs.
    pub fn structure<K, I>(members: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Self)>,
    {
        Self::Struct(members.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Whether this is a `{faultCode, faultString}` struct.
    pub fn is_fault(&self) -> bool {
        self.fault_code().is_some()
    }

    /// Code of a fault value.
    pub fn fault_code(&self) -> Option<i32> {
        match self {
            Self::Struct(members) if members.len() == 2 => {
                members.get(FAULT_STRING_KEY)?.as_str()?;
                members.get(FAULT_CODE_KEY)?.as_i32()
            }
            _ => None,
        }
    }

    /// Message of a fault value.
    pub fn fault_string(&self) -> Option<&str> {
        self.fault_code()?;
        match self {
            Self::Struct(members) => members.get(FAULT_STRING_KEY)?.as_str(),
            _ => None,
        }
    }

    /// The value of an `Integer`.
    pub const fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer of either width.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(i64::from(*v)),
            Self::Integer64(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_struct(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Struct(v) => Some(v),
            _ => None,
        }
    }

    /// Struct member lookup; `None` for non-structs.
    pub fn get(&self, key: &str) -> Option<&Self> {
        self.as_struct()?.get(key)
    }

    /// Convert to JSON for logs and the command line.
    ///
    /// Binary data becomes an array of byte values.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Void => Json::Null,
            Self::Integer(v) => Json::from(*v),
            Self::Integer64(v) => Json::from(*v),
            Self::Boolean(v) => Json::Bool(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v).map_or(Json::Null, Json::Number),
            Self::String(v) => Json::String(v.clone()),
            Self::Binary(v) => Json::Array(v.iter().map(|b| Json::from(*b)).collect()),
            Self::Array(v) => Json::Array(v.iter().map(Self::to_json).collect()),
            Self::Struct(v) => Json::Object(v.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Self::Void,
            Json::Bool(v) => Self::Boolean(v),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i32::try_from(i).map_or(Self::Integer64(i), Self::Integer)
                } else {
                    Self::Float(n.as_f64().unwrap_or_default())
                }
            }
            Json::String(v) => Self::String(v),
            Json::Array(v) => Self::Array(v.into_iter().map(Self::from).collect()),
            Json::Object(v) => Self::Struct(v.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer64(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        i32::try_from(v).map_or(Self::Integer64(i64::from(v)), Self::Integer)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<Self>> for Value {
    fn from(v: Vec<Self>) -> Self {
        Self::Array(v)
    }
}

impl From<BTreeMap<String, Self>> for Value {
    fn from(v: BTreeMap<String, Self>) -> Self {
        Self::Struct(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    /// A response whose value is a fault struct.
    Fault,
}

impl FrameKind {
    /// Type byte on the wire.
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Request => 0x00,
            Self::Response => 0x01,
            Self::Fault => 0xFF,
        }
    }

    /// Parse a type byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Request),
            0x01 => Some(Self::Response),
            0xFF => Some(Self::Fault),
            _ => None,
        }
    }

    pub const fn is_request(self) -> bool {
        matches!(self, Self::Request)
    }
}

/// A decoded method call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub packet_id: i32,
    pub wants_response: bool,
    pub method: String,
    pub args: Vec<Value>,
}

/// A decoded response. Fault frames decode to a fault `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub packet_id: i32,
    pub value: Value,
}

/// A fully decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

/// A complete frame whose header has been parsed but whose payload has not.
///
/// The reader only peeks at the method name so it can route the bootstrap
/// call; argument decoding happens on dispatcher tasks.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub kind: FrameKind,
    pub packet_id: i32,
    pub wants_response: bool,
    /// Method name for requests, `None` for responses.
    pub method: Option<String>,
    /// The whole frame, header included.
    pub bytes: Vec<u8>,
}

impl RawFrame {
    /// Decode the payload.
    pub fn decode(&self) -> Result<Frame, crate::error::ProtocolError> {
        super::decode_frame(&self.bytes)
    }
}
