//! Workers packaged as container images.
//!
//! The worker runs in the foreground of `<runtime> run -i --rm --name <name>`
//! so the pipe protocol flows through the runtime client's stdio. Killing the
//! client does not stop the container, so the adapter removes it by name
//! when it shuts down, and before starting in case an earlier run left one
//! behind.

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ProcessSpec;
use crate::error::AdapterError;

const REMOVE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerSpec {
    /// Container runtime client, `docker` or a compatible CLI.
    pub runtime: String,
    pub image: String,
    /// Container name. Defaults to `lockstep-<node_id>`.
    pub name: Option<String>,
    /// Extra flags for `run`, placed before the image.
    pub run_args: Vec<String>,
    pub remove_timeout_ms: u64,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: String::new(),
            name: None,
            run_args: Vec::new(),
            remove_timeout_ms: 10_000,
        }
    }
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.runtime.trim().is_empty() {
            return Err(AdapterError::config("container runtime is empty"));
        }
        if self.image.trim().is_empty() {
            return Err(AdapterError::config("container image is empty"));
        }
        Ok(())
    }

    pub fn container_name(&self, node_id: &str) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        // Runtime names allow [a-zA-Z0-9_.-].
        let id: String = node_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' })
            .collect();
        format!("lockstep-{id}")
    }

    /// Host-side command that starts the container. `inner` is what runs
    /// inside it: its command follows the image (empty keeps the image
    /// entrypoint), its env and working dir become `-e` and `-w` flags.
    pub fn launch_spec(&self, node_id: &str, inner: &ProcessSpec) -> ProcessSpec {
        let mut command = vec![
            self.runtime.clone(),
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            self.container_name(node_id),
        ];
        for (key, value) in &inner.env {
            command.push("-e".to_string());
            command.push(format!("{key}={value}"));
        }
        if let Some(dir) = &inner.working_dir {
            command.push("-w".to_string());
            command.push(dir.display().to_string());
        }
        command.extend(self.run_args.iter().cloned());
        command.push(self.image.clone());
        command.extend(inner.command.iter().cloned());
        ProcessSpec {
            command,
            ..ProcessSpec::default()
        }
    }

    /// `<runtime> rm -f <name>`, bounded by `remove_timeout_ms`. Removing a
    /// container that does not exist is not an error for the caller; the
    /// runtime's complaint is only logged.
    pub fn remove(&self, node_id: &str) -> Result<(), AdapterError> {
        let name = self.container_name(node_id);
        let target = format!("{} rm -f {name}", self.runtime);
        let mut child = Command::new(&self.runtime)
            .args(["rm", "-f", &name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AdapterError::Connection {
                target: target.clone(),
                reason: e.to_string(),
            })?;

        let deadline = Instant::now() + Duration::from_millis(self.remove_timeout_ms);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(node_id, container = %name, %status, "container removed");
                    return Ok(());
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(REMOVE_POLL),
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(AdapterError::Timeout {
                        waiting_for: target,
                        elapsed: Duration::from_millis(self.remove_timeout_ms),
                        polls: 0,
                    });
                }
                Err(e) => {
                    return Err(AdapterError::Connection {
                        target,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}
