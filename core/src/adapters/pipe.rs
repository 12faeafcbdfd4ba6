//! Adapter for worker processes speaking the line protocol over stdio.
//!
//! ```text
//! -> INIT <json-object>        <- READY | ERROR <message>
//! -> ADVANCE <target_us>
//! -> <json-array>              <- DONE | ERROR <message>
//!                              <- <json-array>
//! -> SHUTDOWN                  (worker exits)
//! ```
//!
//! With a `container` the worker is started from an image and the container
//! is removed again at shutdown, whatever state the worker was left in.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::container::ContainerSpec;
use super::process::WorkerProcess;
use super::{stamp_source, ProcessSpec};
use crate::error::AdapterError;
use crate::event::Event;
use crate::traits::{check_advance, AdapterKind, AdapterState, InitContext, NodeAdapter, NodeId, ShutdownOutcome};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipeConfig {
    /// Worker command. With `container` set, this is the command run inside
    /// the container and may be empty.
    pub process: ProcessSpec,
    pub container: Option<ContainerSpec>,
    /// Passed through verbatim in the INIT message.
    pub params: Value,
    pub response_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub poll_interval_ms: u64,
    pub queue_capacity: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            process: ProcessSpec::default(),
            container: None,
            params: Value::Null,
            response_timeout_ms: 30_000,
            handshake_timeout_ms: 10_000,
            shutdown_grace_ms: 5_000,
            poll_interval_ms: 50,
            queue_capacity: 256,
        }
    }
}

impl PipeConfig {
    pub fn new(process: ProcessSpec, params: Value) -> Self {
        Self {
            process,
            params,
            ..Self::default()
        }
    }

    /// Worker packaged as an image, run through `docker run -i`.
    pub fn in_container(container: ContainerSpec, process: ProcessSpec, params: Value) -> Self {
        Self {
            process,
            container: Some(container),
            params,
            ..Self::default()
        }
    }

    fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// The command actually spawned on the host.
    fn launch_spec(&self, node_id: &str) -> Result<ProcessSpec, AdapterError> {
        match &self.container {
            Some(container) => {
                container.validate()?;
                Ok(container.launch_spec(node_id, &self.process))
            }
            None => {
                self.process.validate()?;
                Ok(self.process.clone())
            }
        }
    }
}

pub struct PipeProtocolAdapter {
    node_id: NodeId,
    config: PipeConfig,
    state: AdapterState,
    current_time_us: u64,
    process: Option<WorkerProcess>,
}

impl PipeProtocolAdapter {
    pub fn new(node_id: impl Into<NodeId>, config: PipeConfig) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            state: AdapterState::Created,
            current_time_us: 0,
            process: None,
        }
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// OS process id of the worker, while one is attached.
    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().map(WorkerProcess::pid)
    }

    /// Name of the container hosting the worker, when it runs in one.
    pub fn container_name(&self) -> Option<String> {
        self.config
            .container
            .as_ref()
            .map(|c| c.container_name(&self.node_id))
    }

    fn connect(&mut self) -> Result<&mut WorkerProcess, AdapterError> {
        let spec = self.config.launch_spec(&self.node_id)?;
        if let Some(container) = &self.config.container {
            // A container left over from an aborted run would block the name.
            if let Err(e) = container.remove(&self.node_id) {
                debug!(node_id = %self.node_id, error = %e, "stale container cleanup failed");
            }
        }
        let process = WorkerProcess::spawn(&self.node_id, &spec, true, self.config.queue_capacity)?;
        self.state.transition(AdapterState::Connected)?;
        Ok(self.process.insert(process))
    }

    fn worker(&mut self) -> Result<&mut WorkerProcess, AdapterError> {
        self.process
            .as_mut()
            .ok_or_else(|| AdapterError::protocol("no worker process attached"))
    }

    /// Reads one reply line and rejects `ERROR` replies.
    fn expect_reply(&mut self, expected: &str, timeout: Duration) -> Result<String, AdapterError> {
        let poll = self.config.poll();
        let node_id = self.node_id.clone();
        let line = self.worker()?.read_line(timeout, poll, expected)?;
        if let Some(message) = line.strip_prefix("ERROR") {
            return Err(AdapterError::protocol(format!(
                "{node_id} reported error while {expected} was expected: {}",
                message.trim()
            )));
        }
        Ok(line)
    }
}

impl NodeAdapter for PipeProtocolAdapter {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Pipe
    }

    fn state(&self) -> AdapterState {
        self.state
    }

    fn current_time_us(&self) -> u64 {
        self.current_time_us
    }

    fn initialize(&mut self, ctx: &InitContext) -> Result<(), AdapterError> {
        if self.state != AdapterState::Created {
            return Err(AdapterError::protocol(format!(
                "{}: initialize called in state {:?}",
                self.node_id, self.state
            )));
        }
        let init = json!({
            "node_id": self.node_id,
            "seed": ctx.seed,
            "global_seed": ctx.global_seed,
            "params": self.config.params,
        });
        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);

        let worker = self.connect()?;
        worker.write_line(&format!("INIT {init}"))?;
        let reply = self.expect_reply("READY", timeout)?;
        if reply.trim() != "READY" {
            return Err(AdapterError::protocol(format!(
                "{}: expected READY, got {reply:?}",
                self.node_id
            )));
        }
        self.state.transition(AdapterState::Initialized)?;
        info!(node_id = %self.node_id, pid = self.process_id(), "pipe worker ready");
        Ok(())
    }

    fn advance_to(&mut self, target_time_us: u64, inbound: Vec<Event>) -> Result<Vec<Event>, AdapterError> {
        // Nothing reaches the worker unless the handshake completed.
        check_advance(&self.node_id, self.state, self.current_time_us, target_time_us)?;
        let batch = serde_json::to_string(&inbound)
            .map_err(|e| AdapterError::protocol(format!("cannot encode inbound events: {e}")))?;
        let timeout = Duration::from_millis(self.config.response_timeout_ms);

        let worker = self.worker()?;
        worker.check_alive()?;
        worker.write_line(&format!("ADVANCE {target_time_us}"))?;
        worker.write_line(&batch)?;

        let reply = self.expect_reply("DONE", timeout)?;
        if reply.trim() != "DONE" {
            return Err(AdapterError::protocol(format!(
                "{}: expected DONE, got {reply:?}",
                self.node_id
            )));
        }
        let body = self.expect_reply("event array", timeout)?;
        let mut events: Vec<Event> = serde_json::from_str(&body).map_err(|e| {
            AdapterError::protocol(format!("{}: malformed event array: {e}", self.node_id))
        })?;
        stamp_source(&mut events, &self.node_id);
        self.worker()?.drain_stderr();

        debug!(
            node_id = %self.node_id,
            from_us = self.current_time_us,
            target_us = target_time_us,
            events = events.len(),
            "pipe step"
        );
        self.current_time_us = target_time_us;
        self.state.transition(AdapterState::Running)?;
        Ok(events)
    }

    fn shutdown(&mut self) -> ShutdownOutcome {
        if self.state == AdapterState::ShutDown {
            return ShutdownOutcome::AlreadyShutDown;
        }
        self.state = AdapterState::ShutDown;
        let Some(mut worker) = self.process.take() else {
            return ShutdownOutcome::Graceful;
        };
        if !worker.has_exited() {
            if let Err(e) = worker.write_line("SHUTDOWN") {
                debug!(node_id = %self.node_id, error = %e, "SHUTDOWN not delivered");
            }
        }
        let mut outcome = worker.terminate(Duration::from_millis(self.config.shutdown_grace_ms));
        if outcome == ShutdownOutcome::Forced {
            warn!(node_id = %self.node_id, "pipe worker was killed");
        }
        if let Some(container) = &self.config.container {
            if let Err(e) = container.remove(&self.node_id) {
                warn!(
                    node_id = %self.node_id,
                    container = %container.container_name(&self.node_id),
                    error = %e,
                    "container could not be removed"
                );
                outcome = ShutdownOutcome::Forced;
            }
        }
        outcome
    }
}

impl Drop for PipeProtocolAdapter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
