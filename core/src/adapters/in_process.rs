use tracing::debug;

use super::stamp_source;
use crate::behaviors::Behavior;
use crate::buffer::TimeWindow;
use crate::error::AdapterError;
use crate::event::Event;
use crate::traits::{check_advance, AdapterKind, AdapterState, InitContext, NodeAdapter, NodeId, ShutdownOutcome};

/// Runs a [`Behavior`] directly on the coordinator thread.
pub struct InProcessAdapter {
    node_id: NodeId,
    behavior: Box<dyn Behavior>,
    state: AdapterState,
    current_time_us: u64,
}

impl InProcessAdapter {
    pub fn new(node_id: impl Into<NodeId>, behavior: Box<dyn Behavior>) -> Self {
        Self {
            node_id: node_id.into(),
            behavior,
            state: AdapterState::Created,
            current_time_us: 0,
        }
    }

    pub fn behavior(&self) -> &dyn Behavior {
        self.behavior.as_ref()
    }
}

impl NodeAdapter for InProcessAdapter {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::InProcess
    }

    fn state(&self) -> AdapterState {
        self.state
    }

    fn current_time_us(&self) -> u64 {
        self.current_time_us
    }

    fn initialize(&mut self, ctx: &InitContext) -> Result<(), AdapterError> {
        self.state.transition(AdapterState::Connected)?;
        self.behavior.init(&self.node_id, ctx.seed)?;
        self.state.transition(AdapterState::Initialized)?;
        debug!(node_id = %self.node_id, behavior = self.behavior.kind(), "in-process node ready");
        Ok(())
    }

    fn advance_to(&mut self, target_time_us: u64, inbound: Vec<Event>) -> Result<Vec<Event>, AdapterError> {
        check_advance(&self.node_id, self.state, self.current_time_us, target_time_us)?;
        let window = TimeWindow::new(self.current_time_us, target_time_us);
        let mut out = self.behavior.advance(window, inbound);
        stamp_source(&mut out, &self.node_id);
        self.current_time_us = target_time_us;
        self.state.transition(AdapterState::Running)?;
        Ok(out)
    }

    fn shutdown(&mut self) -> ShutdownOutcome {
        if self.state == AdapterState::ShutDown {
            return ShutdownOutcome::AlreadyShutDown;
        }
        self.behavior.shutdown();
        self.state = AdapterState::ShutDown;
        ShutdownOutcome::Graceful
    }
}
