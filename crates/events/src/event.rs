//! The progress event record.

use core::cmp::Ordering;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reelforge_core::{CorrelationId, JobId};

use crate::phase::Phase;

/// Kind of progress event, as named on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    JobStatus,
    StepStatus,
    StepProgress,
    Warning,
    Error,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobStatus => "job-status",
            EventType::StepStatus => "step-status",
            EventType::StepProgress => "step-progress",
            EventType::Warning => "warning",
            EventType::Error => "error",
            EventType::JobCompleted => "job-completed",
            EventType::JobFailed => "job-failed",
            EventType::JobCancelled => "job-cancelled",
        }
    }

    /// Events after which no further events are produced for the job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::JobCompleted | EventType::JobFailed | EventType::JobCancelled
        )
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream cursor of the form `{unixMillis}-{sequence}`.
///
/// The sequence is assigned per job by the broadcaster and strictly
/// increases, so ordering compares the sequence first. The millisecond part
/// only breaks ties between cursors minted by different broadcasters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EventId {
    millis: i64,
    sequence: u64,
}

impl EventId {
    pub fn new(millis: i64, sequence: u64) -> Self {
        Self { millis, sequence }
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Ord for EventId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.millis.cmp(&other.millis))
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}", self.millis, self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed event id: {0:?}")]
pub struct EventIdParseError(pub String);

impl FromStr for EventId {
    type Err = EventIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (millis, sequence) = trimmed
            .split_once('-')
            .ok_or_else(|| EventIdParseError(s.to_string()))?;
        let millis = millis
            .parse::<i64>()
            .map_err(|_| EventIdParseError(s.to_string()))?;
        let sequence = sequence
            .parse::<u64>()
            .map_err(|_| EventIdParseError(s.to_string()))?;
        Ok(Self { millis, sequence })
    }
}

impl From<EventId> for String {
    fn from(value: EventId) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for EventId {
    type Error = EventIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// An update reported by the job state machine, before the broadcaster
/// stamps it with an id, phase and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub event_type: EventType,
    pub stage: String,
    pub percent: u8,
    pub message: String,
    pub correlation_id: Option<CorrelationId>,
}

impl ProgressUpdate {
    pub fn new(
        job_id: JobId,
        event_type: EventType,
        stage: impl Into<String>,
        percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            event_type,
            stage: stage.into(),
            percent,
            message: message.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Immutable progress record delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub event_id: EventId,
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub stage: String,
    pub phase: Phase,
    pub percent: u8,
    pub message: String,
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Stamp an update with its id; the phase is derived from the stage.
    pub fn stamp(update: ProgressUpdate, event_id: EventId, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id,
            job_id: update.job_id,
            event_type: update.event_type,
            phase: Phase::from_stage(&update.stage),
            stage: update.stage,
            percent: update.percent,
            message: update.message,
            correlation_id: update.correlation_id,
            timestamp,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_parses_its_display_form() {
        let id = EventId::new(1_700_000_000_123, 42);
        assert_eq!(id.to_string(), "1700000000123-42");
        assert_eq!("1700000000123-42".parse::<EventId>().unwrap(), id);
    }

    #[test]
    fn event_id_rejects_garbage() {
        assert!("".parse::<EventId>().is_err());
        assert!("abc".parse::<EventId>().is_err());
        assert!("12-x".parse::<EventId>().is_err());
        assert!("-5".parse::<EventId>().is_err());
    }

    #[test]
    fn event_ids_order_by_sequence_first() {
        let earlier_clock_later_seq = EventId::new(1_000, 7);
        let later_clock_earlier_seq = EventId::new(2_000, 6);
        assert!(earlier_clock_later_seq > later_clock_earlier_seq);
    }

    #[test]
    fn event_serializes_with_wire_names() {
        let update = ProgressUpdate::new(JobId::new(), EventType::StepProgress, "TTS", 30, "narrating");
        let event = ProgressEvent::stamp(update, EventId::new(10, 1), Utc::now());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "step-progress");
        assert_eq!(json["eventId"], "10-1");
        assert_eq!(json["phase"], "tts");
        assert_eq!(json["percent"], 30);
    }
}
