//! Scenario files and the glue that turns one into a running coordinator.
//!
//! ```json
//! {
//!   "duration_us": 10000000,
//!   "quantum_us": 1000000,
//!   "seed": 42,
//!   "network": {"mode": "latency", "default_edge": {"latency_us": 5000}},
//!   "nodes": [
//!     {"id": "sensor", "kind": "in_process", "behavior": "periodic",
//!      "params": {"destination": "gateway"}},
//!     {"id": "gateway", "kind": "pipe",
//!      "process": {"command": ["lockstep-worker"]},
//!      "params": {"behavior": "relay"}},
//!     {"id": "device", "kind": "socket", "port": 1234}
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::adapters::emulator::{EmulatorConfig, EmulatorSocketAdapter};
use crate::adapters::in_process::InProcessAdapter;
use crate::adapters::pipe::{PipeConfig, PipeProtocolAdapter};
use crate::behaviors::create_behavior;
use crate::engine::{Coordinator, RunReport};
use crate::error::LaunchError;
use crate::network::{NetworkConfig, NetworkModel};
use crate::traits::{NodeAdapter, NodeId};
use crate::DEFAULT_QUANTUM_US;

fn default_quantum() -> u64 {
    DEFAULT_QUANTUM_US
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub duration_us: u64,
    #[serde(default = "default_quantum")]
    pub quantum_us: u64,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub network: NetworkConfig,
    pub nodes: Vec<NodeConfig>,
    /// Include every emitted and delivered event in the report.
    #[serde(default)]
    pub record_events: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    #[serde(flatten)]
    pub adapter: AdapterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    InProcess {
        behavior: String,
        #[serde(default)]
        params: Value,
    },
    Pipe(PipeConfig),
    Socket(EmulatorConfig),
}

impl Scenario {
    pub fn from_json(text: &str) -> Result<Self, LaunchError> {
        let scenario: Scenario = serde_json::from_str(text)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LaunchError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| LaunchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.duration_us == 0 {
            return Err(LaunchError::Invalid("duration_us must be positive".into()));
        }
        if self.quantum_us == 0 {
            return Err(LaunchError::Invalid("quantum_us must be positive".into()));
        }
        if self.nodes.is_empty() {
            return Err(LaunchError::Invalid("scenario has no nodes".into()));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(LaunchError::Invalid("node id must not be empty".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(LaunchError::Invalid(format!("duplicate node id {:?}", node.id)));
            }
        }
        if let NetworkConfig::Latency { links, .. } = &self.network {
            for link in links {
                for end in [&link.src, &link.dst] {
                    if !seen.contains(end.as_str()) {
                        return Err(LaunchError::Invalid(format!("link references unknown node {end:?}")));
                    }
                }
            }
        }
        if self.duration_us % self.quantum_us != 0 {
            warn!(
                duration_us = self.duration_us,
                quantum_us = self.quantum_us,
                "duration is not a multiple of the quantum, last step is shorter"
            );
        }
        Ok(())
    }
}

pub fn build_adapter(node: &NodeConfig) -> Result<Box<dyn NodeAdapter>, LaunchError> {
    let adapter: Box<dyn NodeAdapter> = match &node.adapter {
        AdapterConfig::InProcess { behavior, params } => {
            let behavior = create_behavior(behavior, params.clone()).map_err(|source| LaunchError::Adapter {
                node_id: node.id.clone(),
                source,
            })?;
            Box::new(InProcessAdapter::new(node.id.clone(), behavior))
        }
        AdapterConfig::Pipe(config) => Box::new(PipeProtocolAdapter::new(node.id.clone(), config.clone())),
        AdapterConfig::Socket(config) => Box::new(EmulatorSocketAdapter::new(node.id.clone(), config.clone())),
    };
    Ok(adapter)
}

pub struct Launcher {
    scenario: Scenario,
}

impl Launcher {
    pub fn new(scenario: Scenario) -> Result<Self, LaunchError> {
        scenario.validate()?;
        Ok(Self { scenario })
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Network model plus every adapter, registered in scenario order.
    pub fn build(&self) -> Result<Coordinator, LaunchError> {
        let network = NetworkModel::from_config(&self.scenario.network, self.scenario.seed)?;
        let mut coordinator = Coordinator::new(network).with_event_recording(self.scenario.record_events);
        for node in &self.scenario.nodes {
            coordinator.register_adapter(build_adapter(node)?)?;
        }
        Ok(coordinator)
    }

    /// Initialize, run, shut down. Adapters are shut down on every path.
    pub fn run(&self) -> Result<RunReport, LaunchError> {
        let mut coordinator = self.build()?;
        info!(
            nodes = self.scenario.nodes.len(),
            duration_us = self.scenario.duration_us,
            quantum_us = self.scenario.quantum_us,
            seed = self.scenario.seed,
            "launching scenario"
        );
        let result = coordinator
            .initialize_all(self.scenario.seed)
            .and_then(|()| coordinator.run_until(self.scenario.duration_us, self.scenario.quantum_us));
        coordinator.shutdown_all();
        Ok(result?)
    }
}

/// Loads a scenario file and runs it to completion.
pub fn run(path: impl AsRef<Path>) -> Result<RunReport, LaunchError> {
    Launcher::new(Scenario::load(path)?)?.run()
}
