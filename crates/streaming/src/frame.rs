//! Stream frames and their SSE rendering.
//!
//! ```text
//! id: 1718000000000-7
//! event: step-progress
//! data: {"eventId":"1718000000000-7",...}
//!
//! : keepalive: 2024-06-10T08:00:10Z
//!
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

use reelforge_events::{EventId, ProgressEvent};

use crate::error::StreamError;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A progress event; carries the client cursor
    Progress(ProgressEvent),
    /// Comment-only heartbeat; no id
    Keepalive(DateTime<Utc>),
    /// Sent to every live connection when the server begins shutting down
    Shutdown { message: String },
    /// Final frame of a connection closed by the server
    Error { message: String },
}

impl Frame {
    pub fn shutdown(message: impl Into<String>) -> Self {
        Frame::Shutdown {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }

    pub fn keepalive_now() -> Self {
        Frame::Keepalive(Utc::now())
    }

    /// SSE `event:` name; `None` for comment frames.
    pub fn event_name(&self) -> Option<&'static str> {
        match self {
            Frame::Progress(event) => Some(event.event_type.as_str()),
            Frame::Keepalive(_) => None,
            Frame::Shutdown { .. } => Some("shutdown"),
            Frame::Error { .. } => Some("error"),
        }
    }

    pub fn event_id(&self) -> Option<EventId> {
        match self {
            Frame::Progress(event) => Some(event.event_id),
            _ => None,
        }
    }

    /// JSON payload; `None` for comment frames.
    pub fn data(&self) -> Result<Option<String>, StreamError> {
        let data = match self {
            Frame::Progress(event) => serde_json::to_string(event)?,
            Frame::Keepalive(_) => return Ok(None),
            Frame::Shutdown { message } => json!({ "reason": message }).to_string(),
            Frame::Error { message } => json!({ "error": message }).to_string(),
        };
        Ok(Some(data))
    }

    /// Comment text for heartbeat frames.
    pub fn comment(&self) -> Option<String> {
        match self {
            Frame::Keepalive(at) => Some(format!(
                "keepalive: {}",
                at.to_rfc3339_opts(SecondsFormat::Secs, true)
            )),
            _ => None,
        }
    }

    /// Whether the connection ends after this frame.
    pub fn is_closing(&self) -> bool {
        match self {
            Frame::Progress(event) => event.is_terminal(),
            Frame::Keepalive(_) => false,
            Frame::Shutdown { .. } | Frame::Error { .. } => true,
        }
    }

    /// Render as SSE text, including the terminating blank line.
    pub fn to_wire(&self) -> Result<String, StreamError> {
        if let Some(comment) = self.comment() {
            return Ok(format!(": {comment}\n\n"));
        }

        let mut out = String::new();
        if let Some(id) = self.event_id() {
            out.push_str(&format!("id: {id}\n"));
        }
        if let Some(name) = self.event_name() {
            out.push_str(&format!("event: {name}\n"));
        }
        if let Some(data) = self.data()? {
            for line in data.lines() {
                out.push_str(&format!("data: {line}\n"));
            }
        }
        out.push('\n');
        Ok(out)
    }
}
