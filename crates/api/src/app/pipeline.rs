//! Stage executors run for every submitted job.
//!
//! Provider work is simulated with a delay per step; every step still goes
//! through the resilience pipeline under the stage's dependency key so retry,
//! circuit breaking and cancellation behave as they would for real calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use reelforge_core::PipelineStage;
use reelforge_events::Phase;
use reelforge_jobs::{StageContext, StageError, StageExecutor};
use reelforge_resilience::ProviderError;

/// One pipeline stage backed by a single provider.
#[derive(Debug, Clone)]
pub struct SimulatedStage {
    stage: PipelineStage,
    provider_key: &'static str,
    steps: u8,
    step_delay: Duration,
}

impl SimulatedStage {
    pub fn new(stage: PipelineStage, provider_key: &'static str, steps: u8, step_delay: Duration) -> Self {
        Self {
            stage,
            provider_key,
            steps: steps.max(1),
            step_delay,
        }
    }

    /// Percent reported after `step` of `steps`, inside the stage's phase range.
    fn percent_after(&self, step: u8) -> i32 {
        let (start, end) = Phase::from_stage(self.stage.as_str())
            .percent_range()
            .unwrap_or((0, 100));
        let span = i32::from(end) - i32::from(start);
        i32::from(start) + span * i32::from(step) / i32::from(self.steps)
    }
}

#[async_trait]
impl StageExecutor for SimulatedStage {
    fn stage(&self) -> &str {
        self.stage.as_str()
    }

    async fn run(&self, ctx: &StageContext) -> Result<(), StageError> {
        for step in 1..=self.steps {
            let delay = self.step_delay;
            ctx.call(self.provider_key, move || async move {
                tokio::time::sleep(delay).await;
                Ok::<_, ProviderError>(())
            })
            .await?;

            ctx.report(
                self.percent_after(step),
                &format!("{} {step}/{}", self.stage, self.steps),
            )?;
        }
        Ok(())
    }
}

/// Script, voice, visuals, composition and rendering, in order.
pub fn default_stages(step_delay: Duration) -> Vec<Arc<dyn StageExecutor>> {
    vec![
        Arc::new(SimulatedStage::new(PipelineStage::Script, "llm:script", 2, step_delay)),
        Arc::new(SimulatedStage::new(PipelineStage::Voice, "tts:synthesize", 2, step_delay)),
        Arc::new(SimulatedStage::new(PipelineStage::Visuals, "image:generate", 3, step_delay)),
        Arc::new(SimulatedStage::new(PipelineStage::Composition, "timeline:compose", 1, step_delay)),
        Arc::new(SimulatedStage::new(PipelineStage::Rendering, "render:encode", 2, step_delay)),
    ]
}
