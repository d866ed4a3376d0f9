//! Pipeline stage vocabulary.
//!
//! Job stages are free-form labels (executors may report any name), but the
//! runtime knows the canonical pipeline so it can answer resumability
//! questions.

use serde::{Deserialize, Serialize};

/// Canonical stages of the generation pipeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStage {
    Initialization,
    Script,
    Voice,
    Visuals,
    Composition,
    Rendering,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 6] = [
        PipelineStage::Initialization,
        PipelineStage::Script,
        PipelineStage::Voice,
        PipelineStage::Visuals,
        PipelineStage::Composition,
        PipelineStage::Rendering,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Initialization => "Initialization",
            PipelineStage::Script => "Script",
            PipelineStage::Voice => "Voice",
            PipelineStage::Visuals => "Visuals",
            PipelineStage::Composition => "Composition",
            PipelineStage::Rendering => "Rendering",
        }
    }

    /// Parse a stage label, ignoring ASCII case.
    pub fn parse(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(label.trim()))
    }

    /// Whether a job that completed this stage can be resumed after it.
    ///
    /// Rendering output is not checkpointed and initialization has nothing
    /// to resume from.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            PipelineStage::Script | PipelineStage::Voice | PipelineStage::Visuals
        )
    }
}

impl core::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resumability of a free-form stage label.
pub fn is_resumable_stage(label: &str) -> bool {
    PipelineStage::parse(label).is_some_and(|stage| stage.is_resumable())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_script_voice_and_visuals_are_resumable() {
        assert!(is_resumable_stage("Script"));
        assert!(is_resumable_stage("voice"));
        assert!(is_resumable_stage(" VISUALS "));
        assert!(!is_resumable_stage("Rendering"));
        assert!(!is_resumable_stage("Initialization"));
        assert!(!is_resumable_stage("Composition"));
        assert!(!is_resumable_stage("Mystery"));
    }

    #[test]
    fn parse_round_trips_all_stages() {
        for stage in PipelineStage::ALL {
            assert_eq!(PipelineStage::parse(stage.as_str()), Some(stage));
        }
    }
}
