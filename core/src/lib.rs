pub mod adapters;
pub mod analytics;
pub mod behaviors;
pub mod buffer;
pub mod engine;
pub mod error;
pub mod event;
pub mod launcher;
pub mod network;
pub mod seed;
pub mod traits;
pub mod worker;

pub use adapters::emulator::{EmulatorConfig, EmulatorSocketAdapter};
pub use adapters::in_process::InProcessAdapter;
pub use adapters::pipe::{PipeConfig, PipeProtocolAdapter};
pub use adapters::container::ContainerSpec;
pub use adapters::ProcessSpec;
pub use analytics::{MetricsCollector, NetworkMetrics, NetworkSummary, StepPoint};
pub use behaviors::{create_behavior, Behavior};
pub use buffer::{EventBuffer, TimeWindow};
pub use engine::{Coordinator, RunReport};
pub use error::{AdapterError, CoordinatorError, ErrorKind, LaunchError, Phase};
pub use event::Event;
pub use launcher::{AdapterConfig, Launcher, NodeConfig, Scenario};
pub use network::{canonical_key, EdgeConfig, Link, LinkConfig, NetworkConfig, NetworkMetadata, NetworkModel};
pub use seed::derive_seed;
pub use traits::{AdapterKind, AdapterState, InitContext, NodeAdapter, NodeId, ShutdownOutcome};

/// Virtual time constants (in Microseconds)
pub const US_PER_SECOND: u64 = 1_000_000;
pub const DEFAULT_QUANTUM_US: u64 = 1_000; // 1ms
