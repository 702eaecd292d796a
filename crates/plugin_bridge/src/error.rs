//! Error taxonomy for the plugin bridge.
//!
//! Each phase of a plugin's life has its own enum so callers can tell a
//! launch problem from a handshake problem from a broken connection.
//! [`BridgeError`] wraps them all. I/O errors are held in `Arc` so every
//! error stays `Clone` and can be fanned out to several waiters.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Top-level error returned by the bridge.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl BridgeError {
    /// Short name of the phase that failed, used in host diagnostics.
    pub fn phase(&self) -> &'static str {
        match self {
            BridgeError::Launch(_) => "launch",
            BridgeError::Handshake(_) => "handshake",
            BridgeError::Transport(_) => "transport",
            BridgeError::Dispatch(_) => "dispense",
            BridgeError::Application(_) => "call",
        }
    }
}

/// The plugin executable could not be started or reached.
#[derive(Debug, Clone, Error)]
pub enum LaunchError {
    #[error("plugin executable not found: {}", program.display())]
    NotFound { program: PathBuf },

    #[error("failed to start plugin {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("plugin {pipe} was not captured")]
    MissingPipe { pipe: &'static str },

    #[error("could not connect to plugin at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: Arc<std::io::Error>,
    },
}

/// The subprocess did not prove itself to be a compatible plugin.
///
/// The magic cookie is a guard against running a binary that is not a
/// plugin at all. It is not an authentication mechanism.
#[derive(Debug, Clone, Error)]
pub enum HandshakeError {
    #[error("timed out after {timeout:?} waiting for the plugin to announce itself")]
    Timeout { timeout: Duration },

    #[error("plugin exited before announcing a handshake (status: {status:?})")]
    Exited { status: Option<i32> },

    #[error("malformed handshake line {line:?}: {reason}")]
    Malformed { line: String, reason: String },

    #[error("unsupported core protocol version {got} (expected {expected})")]
    CoreVersion { expected: u32, got: u32 },

    #[error("plugin speaks application protocol {got}, host expects {expected}")]
    AppVersion { expected: u32, got: u32 },

    #[error("unsupported network type {0:?}")]
    UnsupportedNetwork(String),

    #[error("unsupported transport protocol {0:?}")]
    UnsupportedProtocol(String),

    #[error("magic cookie {key} is not set: this binary is a plugin and is not meant to be run directly")]
    CookieMissing { key: String },

    #[error("magic cookie {key} does not match: not a trusted plugin for this host")]
    CookieMismatch { key: String },

    #[error("i/o error during handshake: {0}")]
    Io(Arc<std::io::Error>),
}

/// Failures of the RPC channel itself.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection to plugin closed")]
    ConnectionClosed,

    #[error("call {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("call {method} was cancelled")]
    Cancelled { method: String },

    #[error("failed to encode or decode payload: {0}")]
    Codec(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("plugin reported internal error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("i/o error on transport: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

/// A capability or method could not be resolved.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("unknown capability {name:?}")]
    UnknownCapability { name: String },

    #[error("unknown method {method:?}")]
    UnknownMethod { method: String },

    #[error("invalid params for {method}: {message}")]
    InvalidParams { method: String, message: String },

    #[error("capability {name:?} is registered as {registered}, not {requested}")]
    KindMismatch {
        name: String,
        registered: &'static str,
        requested: &'static str,
    },
}

/// Error returned by a capability implementation, passed through verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ApplicationError {
    pub message: String,
}

impl ApplicationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
