//! Holding area for events a worker produced outside the window currently
//! being requested.
//!
//! Windows are half-open, `[from_us, to_us)`: an event stamped exactly at a
//! step boundary belongs to the step that starts there. Adjacent windows
//! tile the timeline, so every admitted event is released exactly once.

use serde::Serialize;
use tracing::warn;

use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub from_us: u64,
    pub to_us: u64,
}

impl TimeWindow {
    pub fn new(from_us: u64, to_us: u64) -> Self {
        debug_assert!(from_us <= to_us, "window [{from_us}, {to_us}) is inverted");
        Self { from_us, to_us }
    }

    pub fn contains(&self, timestamp_us: u64) -> bool {
        self.from_us <= timestamp_us && timestamp_us < self.to_us
    }

    pub fn len_us(&self) -> u64 {
        self.to_us - self.from_us
    }
}

#[derive(Debug, Clone)]
pub struct BufferedEvent {
    pub event: Event,
    pub buffered_at_us: u64,
}

#[derive(Debug, Default)]
pub struct EventBuffer {
    entries: Vec<BufferedEvent>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves every buffered event due before `window.to_us` out of the
    /// buffer, preserving the order they were buffered in.
    ///
    /// Events older than `window.from_us` can only appear if the caller
    /// skipped time; they are released rather than stranded.
    pub fn release(&mut self, window: TimeWindow) -> Vec<Event> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let (due, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|b| b.event.timestamp_us < window.to_us);
        self.entries = keep;
        due.into_iter().map(|b| b.event).collect()
    }

    /// Sorts one freshly produced event: into `out` when it belongs to
    /// `window`, into the buffer when it is early.
    pub fn admit(&mut self, event: Event, window: TimeWindow, out: &mut Vec<Event>) {
        if window.contains(event.timestamp_us) {
            out.push(event);
        } else if event.timestamp_us < window.from_us {
            warn!(
                source = %event.source,
                timestamp_us = event.timestamp_us,
                from_us = window.from_us,
                "late event released into current window"
            );
            out.push(event);
        } else {
            self.entries.push(BufferedEvent {
                event,
                buffered_at_us: window.from_us,
            });
        }
    }

    /// Full per-advance filter: release what was already due, then sort the
    /// fresh output.
    pub fn filter(&mut self, window: TimeWindow, fresh: impl IntoIterator<Item = Event>) -> Vec<Event> {
        let mut out = self.release(window);
        for event in fresh {
            self.admit(event, window, &mut out);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest timestamp still held back.
    pub fn next_due_us(&self) -> Option<u64> {
        self.entries.iter().map(|b| b.event.timestamp_us).min()
    }

    pub fn entries(&self) -> &[BufferedEvent] {
        &self.entries
    }

    pub fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|b| b.event)
            .collect()
    }
}
