//! Worker process ownership shared by the pipe and emulator adapters.

use std::collections::VecDeque;
use std::io::Write;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::io::{recv_bounded, spawn_line_reader, LineQueue, Overflow, Received};
use super::ProcessSpec;
use crate::error::AdapterError;
use crate::traits::ShutdownOutcome;

const STDERR_TAIL_LINES: usize = 20;
const STDERR_QUEUE: usize = 1024;
// Output the worker flushed just before exiting may still be in the reader.
const EXIT_FLUSH_GRACE: Duration = Duration::from_millis(200);
const REAP_POLL: Duration = Duration::from_millis(10);

pub(crate) struct WorkerProcess {
    node_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<LineQueue>,
    stderr: Option<LineQueue>,
    stderr_tail: VecDeque<String>,
    exit_status: Option<ExitStatus>,
    protocol_stdout: bool,
}

impl WorkerProcess {
    /// Spawns the worker with piped stdio and one reader thread per output
    /// stream. With `protocol_stdout` the stdout lines are kept for the
    /// caller; otherwise they are treated like stderr (logged and dropped).
    pub fn spawn(
        node_id: &str,
        spec: &ProcessSpec,
        protocol_stdout: bool,
        queue_capacity: usize,
    ) -> Result<Self, AdapterError> {
        spec.validate()?;
        let mut command = Command::new(&spec.command[0]);
        command
            .args(&spec.command[1..])
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|e| AdapterError::Connection {
            target: spec.display(),
            reason: e.to_string(),
        })?;

        let spawn_err = |e: std::io::Error| AdapterError::Connection {
            target: spec.display(),
            reason: format!("failed to start stream reader: {e}"),
        };
        let stdout = child.stdout.take().map(|out| {
            let overflow = if protocol_stdout { Overflow::Block } else { Overflow::Drop };
            spawn_line_reader(format!("{node_id}-stdout"), out, queue_capacity, overflow)
        });
        let stderr = child
            .stderr
            .take()
            .map(|err| spawn_line_reader(format!("{node_id}-stderr"), err, STDERR_QUEUE, Overflow::Drop));

        let mut process = Self {
            node_id: node_id.to_string(),
            stdin: child.stdin.take(),
            child,
            stdout: None,
            stderr: None,
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
            exit_status: None,
            protocol_stdout,
        };
        // Reap the child if a reader thread cannot be started.
        match (stdout.transpose(), stderr.transpose()) {
            (Ok(stdout), Ok(stderr)) => {
                process.stdout = stdout;
                process.stderr = stderr;
            }
            (Err(e), _) | (_, Err(e)) => {
                process.kill();
                return Err(spawn_err(e));
            }
        }
        debug!(node_id, pid = process.child.id(), command = %spec.display(), "worker process started");
        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn has_exited(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "could not query worker status");
                false
            }
        }
    }

    pub fn check_alive(&mut self) -> Result<(), AdapterError> {
        if self.has_exited() {
            return Err(self.died());
        }
        Ok(())
    }

    /// Builds the `ProcessDied` error, waiting briefly for the exit status
    /// when the stream closed before the process was reaped.
    pub fn died(&mut self) -> AdapterError {
        let deadline = Instant::now() + EXIT_FLUSH_GRACE;
        while !self.has_exited() && Instant::now() < deadline {
            thread::sleep(REAP_POLL);
        }
        // Let the stderr reader catch up with the last words of the worker.
        if let Some(stderr) = self.stderr.as_ref().map(LineQueue::receiver) {
            while let Ok(line) = stderr.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                self.push_tail(line);
            }
        }
        self.drain_stderr();
        let status = match self.exit_status {
            Some(status) => status.to_string(),
            None => "output stream closed".to_string(),
        };
        AdapterError::ProcessDied {
            status,
            stderr_tail: self.stderr_tail(),
        }
    }

    /// Pulls everything the stderr reader queued, logging each line and
    /// keeping a short tail for diagnostics.
    pub fn drain_stderr(&mut self) {
        let mut lines: Vec<String> = Vec::new();
        if let Some(stderr) = &self.stderr {
            lines.extend(stderr.try_iter());
        }
        // Without a protocol reader, stdout is just more console output.
        if !self.protocol_stdout {
            if let Some(stdout) = &self.stdout {
                lines.extend(stdout.try_iter());
            }
        }
        for line in lines {
            self.push_tail(line);
        }
    }

    fn push_tail(&mut self, line: String) {
        debug!(node_id = %self.node_id, "worker: {line}");
        if self.stderr_tail.len() == STDERR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line);
    }

    pub fn stderr_tail(&self) -> String {
        if self.stderr_tail.is_empty() {
            return "(no stderr output)".to_string();
        }
        self.stderr_tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), AdapterError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(AdapterError::protocol("worker stdin already closed"));
        };
        let written = stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush());
        match written {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(node_id = %self.node_id, error = %e, "write to worker stdin failed");
                Err(self.died())
            }
        }
    }

    /// Next protocol line from stdout, bounded by `timeout`.
    pub fn read_line(&mut self, timeout: Duration, poll: Duration, waiting_for: &str) -> Result<String, AdapterError> {
        let rx = match (&self.stdout, self.protocol_stdout) {
            (Some(stdout), true) => stdout.receiver(),
            _ => return Err(AdapterError::protocol("worker stdout is not captured")),
        };
        let mut flushed = None;
        let received = recv_bounded(&rx, timeout, poll, waiting_for, || {
            if !self.has_exited() {
                return Ok(());
            }
            // A line written right before exit may still be in flight.
            if let Ok(line) = rx.recv_timeout(EXIT_FLUSH_GRACE) {
                flushed = Some(line);
            }
            Err(self.died())
        });
        match (received, flushed) {
            (_, Some(line)) | (Ok(Received::Item(line)), None) => Ok(line),
            (Ok(Received::Closed), None) => Err(self.died()),
            (Err(mut e), None) => {
                self.drain_stderr();
                if let AdapterError::Timeout { waiting_for, .. } = &mut e {
                    waiting_for.push_str(&format!(" from {}", self.node_id));
                }
                Err(e)
            }
        }
    }

    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Waits up to `grace` for the worker to exit on its own, then kills it.
    pub fn terminate(&mut self, grace: Duration) -> ShutdownOutcome {
        self.close_stdin();
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.has_exited() {
                self.drain_stderr();
                return ShutdownOutcome::Graceful;
            }
            thread::sleep(REAP_POLL);
        }
        warn!(node_id = %self.node_id, pid = self.pid(), ?grace, "worker did not exit in time, killing");
        self.kill();
        self.drain_stderr();
        ShutdownOutcome::Forced
    }

    fn kill(&mut self) {
        if self.has_exited() {
            return;
        }
        if let Err(e) = self.child.kill() {
            warn!(node_id = %self.node_id, error = %e, "kill failed");
        }
        match self.child.wait() {
            Ok(status) => self.exit_status = Some(status),
            Err(e) => warn!(node_id = %self.node_id, error = %e, "wait after kill failed"),
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}
