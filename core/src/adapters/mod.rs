pub mod container;
pub mod emulator;
pub mod in_process;
pub(crate) mod io;
pub mod pipe;
pub(crate) mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AdapterError;
use crate::event::Event;

/// How to launch a worker process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSpec {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), AdapterError> {
        match self.command.first() {
            Some(program) if !program.trim().is_empty() => Ok(()),
            _ => Err(AdapterError::config("process command is empty")),
        }
    }

    pub fn display(&self) -> String {
        self.command.join(" ")
    }
}

/// Fills in the source of events whose worker left it blank.
pub(crate) fn stamp_source(events: &mut [Event], node_id: &str) {
    for event in events.iter_mut().filter(|e| e.source.is_empty()) {
        event.source = node_id.to_string();
    }
}
