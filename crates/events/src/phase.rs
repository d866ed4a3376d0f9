//! Stage-to-phase mapping.
//!
//! Clients get a coarse progress bucket that does not depend on the stage
//! names individual executors happen to report. The mapping never changes
//! the percent value itself.

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Tts,
    Visuals,
    Compose,
    Render,
    Complete,
    Processing,
}

impl Phase {
    /// Map a free-form stage label to its phase (ASCII case-insensitive).
    pub fn from_stage(stage: &str) -> Self {
        let stage = stage.trim().to_ascii_lowercase();
        match stage.as_str() {
            "initialization" | "queued" | "script" | "planning" | "brief" => Phase::Plan,
            "tts" | "audio" | "voice" => Phase::Tts,
            "visuals" | "images" | "assets" => Phase::Visuals,
            "composition" | "timeline" | "compose" => Phase::Compose,
            "rendering" | "render" | "encode" => Phase::Render,
            "complete" | "done" => Phase::Complete,
            _ => Phase::Processing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Tts => "tts",
            Phase::Visuals => "visuals",
            Phase::Compose => "compose",
            Phase::Render => "render",
            Phase::Complete => "complete",
            Phase::Processing => "processing",
        }
    }

    /// Approximate percent range covered by the phase, if it has one.
    pub fn percent_range(&self) -> Option<(u8, u8)> {
        match self {
            Phase::Plan => Some((0, 15)),
            Phase::Tts => Some((15, 35)),
            Phase::Visuals => Some((35, 65)),
            Phase::Compose => Some((65, 85)),
            Phase::Render => Some((85, 100)),
            Phase::Complete => Some((100, 100)),
            Phase::Processing => None,
        }
    }
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_stage_group() {
        let cases = [
            (["Initialization", "Queued", "Script"].as_slice(), Phase::Plan),
            (&["Planning", "Brief"], Phase::Plan),
            (&["TTS", "Audio", "Voice"], Phase::Tts),
            (&["Visuals", "Images", "Assets"], Phase::Visuals),
            (&["Composition", "Timeline", "Compose"], Phase::Compose),
            (&["Rendering", "Render", "Encode"], Phase::Render),
            (&["Complete", "Done"], Phase::Complete),
        ];

        for (stages, phase) in cases {
            for stage in stages {
                assert_eq!(Phase::from_stage(stage), phase, "stage {stage}");
            }
        }
    }

    #[test]
    fn mapping_ignores_case_and_whitespace() {
        assert_eq!(Phase::from_stage("tts"), Phase::Tts);
        assert_eq!(Phase::from_stage("  RENDERING "), Phase::Render);
    }

    #[test]
    fn unknown_stages_are_processing() {
        assert_eq!(Phase::from_stage("Upload"), Phase::Processing);
        assert_eq!(Phase::from_stage(""), Phase::Processing);
        assert_eq!(Phase::Processing.percent_range(), None);
    }
}
