//! Worker side of the pipe protocol: hosts a built-in [`Behavior`] behind
//! stdin/stdout so it can run as a separate process.
//!
//! The INIT params select the behavior: `{"behavior": "<kind>", "config": {...}}`.

use std::io::{BufRead, Write};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::behaviors::{create_behavior, Behavior};
use crate::buffer::TimeWindow;
use crate::error::WorkerError;
use crate::event::Event;
use crate::traits::NodeId;

#[derive(Debug, Deserialize)]
struct InitMessage {
    node_id: NodeId,
    seed: u64,
    #[serde(default)]
    params: HostParams,
}

#[derive(Debug, Default, Deserialize)]
struct HostParams {
    #[serde(default)]
    behavior: Option<String>,
    #[serde(default)]
    config: Value,
}

struct Hosted {
    node_id: NodeId,
    behavior: Box<dyn Behavior>,
    current_time_us: u64,
}

fn reply<W: Write>(output: &mut W, line: &str) -> Result<(), WorkerError> {
    output.write_all(line.as_bytes())?;
    output.write_all(b"\n")?;
    output.flush()?;
    Ok(())
}

fn reply_error<W: Write>(output: &mut W, message: &str) -> Result<(), WorkerError> {
    warn!("{message}");
    // Replies are line-framed.
    reply(output, &format!("ERROR {}", message.replace('\n', " ")))
}

fn read_line<R: BufRead>(input: &mut R, buf: &mut String) -> Result<bool, WorkerError> {
    buf.clear();
    Ok(input.read_line(buf)? > 0)
}

fn init(body: &str) -> Result<Hosted, String> {
    let msg: InitMessage = serde_json::from_str(body).map_err(|e| format!("malformed INIT: {e}"))?;
    let kind = msg
        .params
        .behavior
        .ok_or_else(|| "INIT params must name a behavior".to_string())?;
    let mut behavior = create_behavior(&kind, msg.params.config).map_err(|e| e.to_string())?;
    behavior.init(&msg.node_id, msg.seed).map_err(|e| e.to_string())?;
    info!(node_id = %msg.node_id, behavior = %kind, "worker initialized");
    Ok(Hosted {
        node_id: msg.node_id,
        behavior,
        current_time_us: 0,
    })
}

/// Serves the protocol until SHUTDOWN or end of input.
pub fn serve<R: BufRead, W: Write>(mut input: R, mut output: W) -> Result<(), WorkerError> {
    let mut hosted: Option<Hosted> = None;
    let mut line = String::new();

    while read_line(&mut input, &mut line)? {
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
        match verb {
            "INIT" => {
                if hosted.is_some() {
                    reply_error(&mut output, "already initialized")?;
                    continue;
                }
                match init(rest) {
                    Ok(h) => {
                        hosted = Some(h);
                        reply(&mut output, "READY")?;
                    }
                    Err(message) => reply_error(&mut output, &message)?,
                }
            }
            "ADVANCE" => {
                let target: Result<u64, _> = rest.trim().parse();
                // The inbound batch always follows, even when the request is refused.
                let mut batch = String::new();
                if !read_line(&mut input, &mut batch)? {
                    return Err(WorkerError::Protocol("input closed before the ADVANCE batch".into()));
                }
                let Some(h) = hosted.as_mut() else {
                    reply_error(&mut output, "ADVANCE before INIT")?;
                    continue;
                };
                let target = match target {
                    Ok(t) if t >= h.current_time_us => t,
                    Ok(t) => {
                        reply_error(&mut output, &format!("cannot advance backwards to {t}"))?;
                        continue;
                    }
                    Err(e) => {
                        reply_error(&mut output, &format!("bad ADVANCE target {rest:?}: {e}"))?;
                        continue;
                    }
                };
                let inbound: Vec<Event> = match serde_json::from_str(batch.trim()) {
                    Ok(events) => events,
                    Err(e) => {
                        reply_error(&mut output, &format!("malformed event batch: {e}"))?;
                        continue;
                    }
                };
                let window = TimeWindow::new(h.current_time_us, target);
                let produced = h.behavior.advance(window, inbound);
                h.current_time_us = target;
                debug!(node_id = %h.node_id, target_us = target, produced = produced.len(), "advanced");

                let body = serde_json::to_string(&produced)
                    .map_err(|e| WorkerError::Protocol(format!("cannot encode events: {e}")))?;
                reply(&mut output, "DONE")?;
                reply(&mut output, &body)?;
            }
            "SHUTDOWN" => {
                if let Some(h) = hosted.as_mut() {
                    h.behavior.shutdown();
                    info!(node_id = %h.node_id, time_us = h.current_time_us, "worker shutting down");
                }
                return Ok(());
            }
            other => reply_error(&mut output, &format!("unknown command {other:?}"))?,
        }
    }
    debug!("input closed");
    Ok(())
}
