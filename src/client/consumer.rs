//! Consuming end of the chat event stream.
//!
//! [`EventDecoder`] turns raw network reads into events, [`ViewState`] folds
//! events into what the chat view shows. Neither does I/O; the driver in
//! [`super::session`] feeds them.

use crate::event::RelayEvent;
use crate::lines::LineBuffer;
use log::debug;

/// Splits the byte stream into lines and parses the event lines among them.
#[derive(Debug, Default)]
pub struct EventDecoder {
    lines: LineBuffer,
    skipped: usize,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one network read. Returns the events completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RelayEvent> {
        let lines = self.lines.push(chunk);
        lines.iter().filter_map(|line| self.decode(line)).collect()
    }

    /// Flushes a trailing line that was not newline terminated.
    pub fn finish(&mut self) -> Option<RelayEvent> {
        let line = self.lines.finish()?;
        self.decode(&line)
    }

    /// Lines that looked like events but could not be parsed.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn decode(&mut self, line: &str) -> Option<RelayEvent> {
        let event = RelayEvent::from_line(line);
        if event.is_none() && line.starts_with(crate::event::DATA_PREFIX) {
            debug!("skipping malformed event line: {line}");
            self.skipped += 1;
        }
        event
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Idle,
    Streaming,
    Done { message_id: Option<i64> },
    Failed(String),
    Aborted,
}

impl StreamStatus {
    pub fn is_streaming(&self) -> bool {
        matches!(self, StreamStatus::Streaming)
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, StreamStatus::Idle | StreamStatus::Streaming)
    }
}

/// What the view has to do after a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Nothing,
    /// Re-render soon, at most once per frame.
    ScheduleRender,
    /// Re-render now; the stream is over.
    FinalRender,
}

/// The assistant reply as the view sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewState {
    pub text: String,
    pub status: StreamStatus,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            text: String::new(),
            status: StreamStatus::Idle,
        }
    }
}

pub const CONNECTION_LOST: &str = "connection closed before the reply finished";

impl ViewState {
    pub fn start(&mut self) {
        self.text.clear();
        self.status = StreamStatus::Streaming;
    }

    /// Folds one event into the state. Events after the stream ended are ignored.
    pub fn apply(&mut self, event: RelayEvent) -> Effect {
        if self.status.is_finished() {
            return Effect::Nothing;
        }

        match event {
            RelayEvent::Content { content } => {
                self.status = StreamStatus::Streaming;
                self.text.push_str(&content);
                Effect::ScheduleRender
            }
            RelayEvent::Done { message_id } => {
                self.status = StreamStatus::Done { message_id };
                Effect::FinalRender
            }
            RelayEvent::Error { content } => {
                self.status = StreamStatus::Failed(content);
                Effect::FinalRender
            }
        }
    }

    /// Local abort: ends like a normal stream, without an error.
    pub fn abort(&mut self) -> Effect {
        if self.status.is_finished() {
            return Effect::Nothing;
        }
        self.status = StreamStatus::Aborted;
        Effect::FinalRender
    }

    /// The transport ended. Without a terminal event that is a failure.
    pub fn connection_closed(&mut self) -> Effect {
        if self.status.is_finished() {
            return Effect::Nothing;
        }
        self.status = StreamStatus::Failed(CONNECTION_LOST.to_owned());
        Effect::FinalRender
    }

    /// Message to display, if any. Aborts show nothing.
    pub fn error(&self) -> Option<&str> {
        match &self.status {
            StreamStatus::Failed(message) => Some(message),
            _ => None,
        }
    }
}
