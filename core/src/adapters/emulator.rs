//! Adapter for an external instruction-level emulator driven through its
//! text monitor over TCP.
//!
//! Each advance sends `emulation RunFor @<seconds>` and waits for the monitor
//! prompt. Firmware reports events as one-line JSON records, either echoed on
//! the monitor or written to a UART log file. The firmware runs on its own
//! clock and may report ahead of the requested window, so every advance goes
//! through an [`EventBuffer`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::io::{recv_bounded, spawn_chunk_reader, ChunkQueue, Received};
use super::process::WorkerProcess;
use super::ProcessSpec;
use crate::buffer::{EventBuffer, TimeWindow};
use crate::error::AdapterError;
use crate::event::Event;
use crate::traits::{check_advance, AdapterKind, AdapterState, InitContext, NodeAdapter, NodeId, ShutdownOutcome};
use crate::US_PER_SECOND;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmulatorConfig {
    pub host: String,
    pub port: u16,
    /// Emulator to launch before connecting. Without one the adapter
    /// attaches to an already running monitor.
    pub process: Option<ProcessSpec>,
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    /// Monitor commands sent once connected, typically loading the machine
    /// and firmware. `{node_id}`, `{seed}` and `{port}` are substituted.
    pub startup_commands: Vec<String>,
    /// Prompts that terminate a monitor response. Empty selects `(monitor)`
    /// and `(<node_id>)`.
    pub prompts: Vec<String>,
    /// Command template used to hand inbound events to the firmware, with
    /// `{event}` replaced by the event's JSON. Inbound events are discarded
    /// when unset.
    pub inject_command: Option<String>,
    pub command_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    pub queue_capacity: usize,
    /// UART capture file tailed after every advance.
    pub uart_log: Option<PathBuf>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1234,
            process: None,
            connect_retries: 10,
            retry_delay_ms: 500,
            startup_commands: Vec::new(),
            prompts: Vec::new(),
            inject_command: None,
            command_timeout_ms: 30_000,
            poll_interval_ms: 50,
            shutdown_grace_ms: 5_000,
            queue_capacity: 256,
            uart_log: None,
        }
    }
}

impl EmulatorConfig {
    pub fn attach(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn prompts_for(&self, node_id: &str) -> Vec<String> {
        if self.prompts.is_empty() {
            vec!["(monitor)".to_string(), format!("({node_id})")]
        } else {
            self.prompts.clone()
        }
    }

    fn substitute(&self, template: &str, node_id: &str, seed: u64) -> String {
        template
            .replace("{node_id}", node_id)
            .replace("{seed}", &seed.to_string())
            .replace("{port}", &self.port.to_string())
    }
}

/// `RunFor` argument: the window length in seconds with microsecond precision.
pub fn run_for_command(delta_us: u64) -> String {
    format!(
        "emulation RunFor @{}.{:06}",
        delta_us / US_PER_SECOND,
        delta_us % US_PER_SECOND
    )
}

/// Firmware-side view of an event. Accepts the short names emitted by
/// embedded code next to the canonical field names.
#[derive(Debug, Deserialize)]
struct ConsoleRecord {
    #[serde(default, alias = "time")]
    timestamp_us: Option<u64>,
    #[serde(default, alias = "type")]
    event_type: Option<String>,
    #[serde(default, alias = "dst")]
    destination: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    size_bytes: Option<u32>,
}

fn json_object() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{.*\}").expect("static pattern compiles"))
}

/// Extracts events from emulator console text, one JSON record per line.
///
/// Lines without a JSON object are ignored; malformed records are logged and
/// skipped. Records without a timestamp are stamped with `default_ts_us`.
pub fn parse_console_output(text: &str, node_id: &str, default_ts_us: u64) -> Vec<Event> {
    let mut events = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some(found) = json_object().find(line) else {
            continue;
        };
        let value: Value = match serde_json::from_str(found.as_str()) {
            Ok(value) => value,
            Err(e) => {
                warn!(node_id, line, error = %e, "malformed JSON in emulator output");
                continue;
            }
        };
        let record = match ConsoleRecord::deserialize(&value) {
            Ok(record) => record,
            Err(e) => {
                warn!(node_id, line, error = %e, "unusable event record in emulator output");
                continue;
            }
        };
        let mut event = Event::new(
            record.timestamp_us.unwrap_or(default_ts_us),
            record.event_type.unwrap_or_else(|| "UART".to_string()),
            node_id,
        )
        .with_size(record.size_bytes.unwrap_or(line.len() as u32));
        if let Some(destination) = record.destination.filter(|d| !d.is_empty()) {
            event = event.to(destination);
        }
        event.payload = record.payload.unwrap_or(value);
        events.push(event);
    }
    events
}

/// Monitor session: a writer half and a chunk reader thread on the other.
struct MonitorConnection {
    stream: TcpStream,
    chunks: ChunkQueue,
    pending: Vec<u8>,
    prompts: Vec<String>,
}

impl MonitorConnection {
    fn open(node_id: &str, stream: TcpStream, prompts: Vec<String>, capacity: usize) -> std::io::Result<Self> {
        let reader = stream.try_clone()?;
        let chunks = spawn_chunk_reader(format!("{node_id}-monitor"), reader, capacity)?;
        Ok(Self {
            stream,
            chunks,
            pending: Vec::new(),
            prompts,
        })
    }

    fn send(&mut self, command: &str) -> std::io::Result<()> {
        trace!(command, "monitor <-");
        self.stream.write_all(command.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()
    }

    /// Earliest prompt in the pending bytes: `(start, end)`.
    fn find_prompt(&self) -> Option<(usize, usize)> {
        self.prompts
            .iter()
            .filter_map(|p| {
                let p = p.as_bytes();
                self.pending
                    .windows(p.len())
                    .position(|w| w == p)
                    .map(|start| (start, start + p.len()))
            })
            .min()
    }

    /// Collects output up to the next prompt and returns it without the prompt.
    fn read_response(
        &mut self,
        timeout: Duration,
        poll: Duration,
        waiting_for: &str,
        mut process: Option<&mut WorkerProcess>,
    ) -> Result<String, AdapterError> {
        let rx = self.chunks.receiver();
        let started = std::time::Instant::now();
        loop {
            if let Some((start, end)) = self.find_prompt() {
                let response = String::from_utf8_lossy(&self.pending[..start]).into_owned();
                self.pending.drain(..end);
                return Ok(response);
            }
            let remaining = timeout.saturating_sub(started.elapsed());
            let received = recv_bounded(&rx, remaining, poll, waiting_for, || match process.as_deref_mut() {
                Some(worker) => worker.check_alive(),
                None => Ok(()),
            });
            match received {
                Ok(Received::Item(chunk)) => self.pending.extend_from_slice(&chunk),
                Ok(Received::Closed) => {
                    return Err(match process.as_deref_mut() {
                        Some(worker) => worker.died(),
                        None => AdapterError::ProcessDied {
                            status: "monitor connection closed".to_string(),
                            stderr_tail: String::from_utf8_lossy(&self.pending).into_owned(),
                        },
                    });
                }
                Err(AdapterError::Timeout { waiting_for, polls, .. }) => {
                    return Err(AdapterError::Timeout {
                        waiting_for,
                        elapsed: started.elapsed(),
                        polls,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!(error = %e, "monitor socket already closed");
        }
    }
}

/// Incremental reader over a file the emulator appends UART output to.
#[derive(Debug)]
struct UartTail {
    path: PathBuf,
    position: u64,
    partial: String,
}

impl UartTail {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            position: 0,
            partial: String::new(),
        }
    }

    /// Complete lines appended since the last read. A trailing partial line
    /// is kept for the next call.
    fn read_new(&mut self) -> std::io::Result<String> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e),
        };
        file.seek(SeekFrom::Start(self.position))?;
        let mut bytes = Vec::new();
        self.position += file.read_to_end(&mut bytes)? as u64;
        self.partial.push_str(&String::from_utf8_lossy(&bytes));
        match self.partial.rfind('\n') {
            Some(idx) => {
                let rest = self.partial.split_off(idx + 1);
                Ok(std::mem::replace(&mut self.partial, rest))
            }
            None => Ok(String::new()),
        }
    }
}

pub struct EmulatorSocketAdapter {
    node_id: NodeId,
    config: EmulatorConfig,
    state: AdapterState,
    current_time_us: u64,
    process: Option<WorkerProcess>,
    monitor: Option<MonitorConnection>,
    uart: Option<UartTail>,
    buffer: EventBuffer,
    /// Records printed while the machine was being set up.
    startup_events: Vec<Event>,
}

impl EmulatorSocketAdapter {
    pub fn new(node_id: impl Into<NodeId>, config: EmulatorConfig) -> Self {
        let uart = config.uart_log.clone().map(UartTail::new);
        Self {
            node_id: node_id.into(),
            config,
            state: AdapterState::Created,
            current_time_us: 0,
            process: None,
            monitor: None,
            uart,
            buffer: EventBuffer::new(),
            startup_events: Vec::new(),
        }
    }

    pub fn buffered(&self) -> &EventBuffer {
        &self.buffer
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.command_timeout_ms)
    }

    fn poll(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    fn connect(&mut self, seed: u64) -> Result<(), AdapterError> {
        if let Some(spec) = &self.config.process {
            let mut spec = spec.clone();
            for arg in spec.command.iter_mut() {
                *arg = self.config.substitute(arg, &self.node_id, seed);
            }
            self.process = Some(WorkerProcess::spawn(
                &self.node_id,
                &spec,
                false,
                self.config.queue_capacity,
            )?);
        }

        let target = self.config.target();
        let attempts = self.config.connect_retries.max(1);
        let mut last_error = String::from("no address resolved");
        for attempt in 1..=attempts {
            if let Some(worker) = self.process.as_mut() {
                worker.check_alive()?;
            }
            match open_stream(&target, self.timeout()) {
                Ok(stream) => {
                    let prompts = self.config.prompts_for(&self.node_id);
                    let monitor = MonitorConnection::open(&self.node_id, stream, prompts, self.config.queue_capacity)
                        .map_err(|e| AdapterError::Connection {
                            target: target.clone(),
                            reason: e.to_string(),
                        })?;
                    self.monitor = Some(monitor);
                    debug!(node_id = %self.node_id, %target, attempt, "monitor connected");
                    return Ok(());
                }
                Err(e) => {
                    trace!(node_id = %self.node_id, %target, attempt, error = %e, "monitor not reachable yet");
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                thread::sleep(Duration::from_millis(self.config.retry_delay_ms));
            }
        }
        Err(AdapterError::Connection {
            target,
            reason: format!("{last_error} after {attempts} attempts"),
        })
    }

    /// Sends one monitor command and waits for the prompt.
    fn command(&mut self, command: &str) -> Result<String, AdapterError> {
        let (timeout, poll) = (self.timeout(), self.poll());
        let monitor = self
            .monitor
            .as_mut()
            .ok_or_else(|| AdapterError::protocol("monitor is not connected"))?;
        if let Err(e) = monitor.send(command) {
            debug!(node_id = %self.node_id, error = %e, "monitor write failed");
            return Err(match self.process.as_mut() {
                Some(worker) => worker.died(),
                None => AdapterError::ProcessDied {
                    status: format!("monitor connection lost: {e}"),
                    stderr_tail: String::new(),
                },
            });
        }
        let response = monitor.read_response(timeout, poll, command, self.process.as_mut())?;
        if let Some(worker) = self.process.as_mut() {
            worker.drain_stderr();
        }
        Ok(response)
    }

    fn read_uart(&mut self) -> String {
        let Some(uart) = self.uart.as_mut() else {
            return String::new();
        };
        match uart.read_new() {
            Ok(text) => text,
            Err(e) => {
                warn!(node_id = %self.node_id, path = %uart.path.display(), error = %e, "could not read UART log");
                String::new()
            }
        }
    }

    fn inject(&mut self, inbound: Vec<Event>) -> Result<(), AdapterError> {
        let Some(template) = self.config.inject_command.clone() else {
            if !inbound.is_empty() {
                debug!(node_id = %self.node_id, count = inbound.len(), "no inject command, inbound events discarded");
            }
            return Ok(());
        };
        for event in inbound {
            let json = serde_json::to_string(&event)
                .map_err(|e| AdapterError::protocol(format!("cannot encode inbound event: {e}")))?;
            self.command(&template.replace("{event}", &json))?;
        }
        Ok(())
    }
}

fn open_stream(target: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last = None;
    for addr in target.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")))
}

impl NodeAdapter for EmulatorSocketAdapter {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Socket
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
        self.connect(ctx.seed)?;
        self.state.transition(AdapterState::Connected)?;

        // The monitor greets with a banner ending in its prompt.
        let (timeout, poll) = (self.timeout(), self.poll());
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.read_response(timeout, poll, "monitor prompt", self.process.as_mut())?;
        }

        let mut output = String::new();
        for template in self.config.startup_commands.clone() {
            let command = self.config.substitute(&template, &self.node_id, ctx.seed);
            output.push_str(&self.command(&command)?);
            output.push('\n');
        }
        self.startup_events = parse_console_output(&output, &self.node_id, 0);

        self.state.transition(AdapterState::Initialized)?;
        info!(node_id = %self.node_id, target = %self.config.target(), "emulator ready");
        Ok(())
    }

    fn advance_to(&mut self, target_time_us: u64, inbound: Vec<Event>) -> Result<Vec<Event>, AdapterError> {
        check_advance(&self.node_id, self.state, self.current_time_us, target_time_us)?;
        let window = TimeWindow::new(self.current_time_us, target_time_us);

        self.inject(inbound)?;
        let mut text = String::new();
        if window.len_us() > 0 {
            text = self.command(&run_for_command(window.len_us()))?;
        }
        text.push('\n');
        text.push_str(&self.read_uart());

        let mut fresh = std::mem::take(&mut self.startup_events);
        fresh.extend(parse_console_output(&text, &self.node_id, window.from_us));
        let out = self.buffer.filter(window, fresh);

        debug!(
            node_id = %self.node_id,
            from_us = window.from_us,
            target_us = target_time_us,
            events = out.len(),
            buffered = self.buffer.len(),
            "emulator step"
        );
        self.current_time_us = target_time_us;
        self.state.transition(AdapterState::Running)?;
        Ok(out)
    }

    fn shutdown(&mut self) -> ShutdownOutcome {
        if self.state == AdapterState::ShutDown {
            return ShutdownOutcome::AlreadyShutDown;
        }
        self.state = AdapterState::ShutDown;

        if !self.buffer.is_empty() {
            warn!(
                node_id = %self.node_id,
                stranded = self.buffer.len(),
                next_due_us = self.buffer.next_due_us(),
                "buffered events never released"
            );
        }
        if let Some(mut monitor) = self.monitor.take() {
            if let Err(e) = monitor.send("quit") {
                debug!(node_id = %self.node_id, error = %e, "quit not delivered");
            }
            monitor.close();
        }
        match self.process.take() {
            Some(mut worker) => {
                let outcome = worker.terminate(Duration::from_millis(self.config.shutdown_grace_ms));
                if outcome == ShutdownOutcome::Forced {
                    warn!(node_id = %self.node_id, "emulator process was killed");
                }
                outcome
            }
            None => ShutdownOutcome::Graceful,
        }
    }
}

impl Drop for EmulatorSocketAdapter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
