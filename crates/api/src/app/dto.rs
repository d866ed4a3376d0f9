use serde::{Deserialize, Serialize};

use reelforge_events::Phase;
use reelforge_jobs::Job;

// -------------------------
// Request DTOs
// -------------------------

/// Query string of `GET /jobs/:id/events`.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(rename = "lastEventId")]
    pub last_event_id: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

/// Job snapshot plus its client-facing phase.
#[derive(Debug, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub phase: &'static str,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let phase = Phase::from_stage(&job.stage).as_str();
        Self { job, phase }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub canceled: bool,
    pub cleanup_scheduled: bool,
    pub job: JobView,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub jobs: usize,
    pub connections: usize,
    pub child_processes: usize,
}
