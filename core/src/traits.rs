use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AdapterError;
use crate::event::Event;

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    InProcess,
    Pipe,
    Socket,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::InProcess => f.write_str("in-process"),
            AdapterKind::Pipe => f.write_str("pipe"),
            AdapterKind::Socket => f.write_str("socket"),
        }
    }
}

/// Adapter lifecycle.
///
/// `Created → Connected → Initialized → Running → ShutDown`. `Running` loops
/// onto itself for every later advance, and any live state may be shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterState {
    Created,
    Connected,
    Initialized,
    Running,
    ShutDown,
}

impl AdapterState {
    pub fn can_transition_to(self, next: AdapterState) -> bool {
        use AdapterState::*;
        match (self, next) {
            (Created, Connected)
            | (Connected, Initialized)
            | (Initialized, Running)
            | (Running, Running) => true,
            (ShutDown, _) => false,
            (_, ShutDown) => true,
            _ => false,
        }
    }

    pub fn transition(&mut self, next: AdapterState) -> Result<(), AdapterError> {
        if !self.can_transition_to(next) {
            return Err(AdapterError::protocol(format!(
                "illegal state transition {:?} -> {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }

    /// `advance_to` is only legal once the handshake has completed.
    pub fn can_advance(self) -> bool {
        matches!(self, AdapterState::Initialized | AdapterState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownOutcome {
    /// The worker acknowledged the shutdown request within the grace period.
    Graceful,
    /// Resources had to be reclaimed by force (process killed).
    Forced,
    /// Nothing to do: the adapter was already shut down.
    AlreadyShutDown,
}

/// Per-adapter initialization input handed out by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitContext {
    pub global_seed: u64,
    /// Seed derived from `(global_seed, node_id)`, independent of other adapters.
    pub seed: u64,
}

/// A simulated component driven through virtual time by the coordinator.
///
/// The coordinator only ever talks to this trait; the in-process, pipe and
/// socket variants are interchangeable behind it.
pub trait NodeAdapter: Send {
    fn node_id(&self) -> &str;
    fn kind(&self) -> AdapterKind;
    fn state(&self) -> AdapterState;
    fn current_time_us(&self) -> u64;

    /// Establishes the transport and completes the readiness handshake.
    fn initialize(&mut self, ctx: &InitContext) -> Result<(), AdapterError>;

    /// Runs the worker over `[current_time_us, target_time_us)`, delivering
    /// `inbound` as input, and returns everything it produced in that window
    /// in emission order.
    fn advance_to(
        &mut self,
        target_time_us: u64,
        inbound: Vec<Event>,
    ) -> Result<Vec<Event>, AdapterError>;

    /// Best-effort termination. Never fails; safe to call repeatedly.
    fn shutdown(&mut self) -> ShutdownOutcome;
}

/// Shared precondition for every `advance_to` implementation.
pub(crate) fn check_advance(
    node_id: &str,
    state: AdapterState,
    current_time_us: u64,
    target_time_us: u64,
) -> Result<(), AdapterError> {
    if !state.can_advance() {
        return Err(AdapterError::protocol(format!(
            "{node_id}: advance_to called in state {state:?}, initialize must succeed first"
        )));
    }
    if target_time_us < current_time_us {
        return Err(AdapterError::protocol(format!(
            "{node_id}: cannot advance backwards from {current_time_us}us to {target_time_us}us"
        )));
    }
    Ok(())
}
