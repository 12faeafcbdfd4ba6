//! Error types for adapters, the coordinator and the launcher.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::traits::NodeId;

/// Coarse classification of an adapter failure, used for run-level reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Connection,
    Protocol,
    Timeout,
    ProcessDied,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Config => "ConfigError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::ProcessDied => "ProcessDiedError",
        };
        f.write_str(name)
    }
}

/// Errors raised by a [`NodeAdapter`](crate::traits::NodeAdapter).
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Bad or missing adapter configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The transport to the worker could not be established.
    #[error("could not connect to {target}: {reason}")]
    Connection { target: String, reason: String },

    /// Malformed or out-of-sequence message.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No response within the configured bound.
    #[error("timed out waiting for {waiting_for} after {elapsed:?} ({polls} polls)")]
    Timeout {
        waiting_for: String,
        elapsed: Duration,
        polls: u32,
    },

    /// The worker process or emulator exited unexpectedly.
    #[error("worker exited unexpectedly ({status}); stderr: {stderr_tail}")]
    ProcessDied { status: String, stderr_tail: String },
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Config(_) => ErrorKind::Config,
            AdapterError::Connection { .. } => ErrorKind::Connection,
            AdapterError::Protocol(_) => ErrorKind::Protocol,
            AdapterError::Timeout { .. } => ErrorKind::Timeout,
            AdapterError::ProcessDied { .. } => ErrorKind::ProcessDied,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        AdapterError::Protocol(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        AdapterError::Config(msg.into())
    }
}

/// The coordinator call in which an adapter failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialize,
    Advance,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Initialize => f.write_str("initialize"),
            Phase::Advance => f.write_str("advance"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("node {0} is already registered")]
    DuplicateNode(NodeId),

    #[error("time quantum must be positive")]
    InvalidQuantum,

    #[error("adapters must be initialized before running")]
    NotInitialized,

    #[error("coordinator has been shut down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    Config(String),

    /// An adapter failed; the run was aborted and every adapter shut down.
    #[error("node {node_id} failed during {phase} at t={time_us}us with {kind}: {source}")]
    Adapter {
        node_id: NodeId,
        phase: Phase,
        time_us: u64,
        kind: ErrorKind,
        #[source]
        source: AdapterError,
    },
}

impl CoordinatorError {
    /// Node id of the failing adapter, when the failure came from one.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            CoordinatorError::Adapter { node_id, .. } => Some(node_id),
            CoordinatorError::DuplicateNode(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to read scenario {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed scenario: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid scenario: {0}")]
    Invalid(String),

    #[error("node {node_id}: {source}")]
    Adapter {
        node_id: NodeId,
        #[source]
        source: AdapterError,
    },

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Errors raised by the worker-side protocol host.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("i/o error on protocol stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),
}
