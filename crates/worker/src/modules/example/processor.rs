use std::ops::RangeInclusive;
use std::time::Duration;

use async_trait::async_trait;
use jobhost_queue::{JobContext, Processor};
use rand::Rng;
use serde_json::{json, Value};

/// Simulates a two-step job: reports 0, 50 and 100 percent with a random
/// pause between steps.
#[derive(Debug, Clone)]
pub struct ExampleProcessor {
    /// Pause per step, in milliseconds.
    step_delay_ms: RangeInclusive<u64>,
}

impl Default for ExampleProcessor {
    fn default() -> Self {
        Self {
            step_delay_ms: 1_000..=10_999,
        }
    }
}

impl ExampleProcessor {
    fn step_delay(&self) -> Duration {
        let ms = rand::rng().random_range(self.step_delay_ms.clone());
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl Processor for ExampleProcessor {
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<Value> {
        ctx.log(format!("job started on {}", chrono::Utc::now().to_rfc3339()))
            .await?;
        ctx.update_progress(0u8).await?;

        tokio::time::sleep(self.step_delay()).await;
        ctx.update_progress(50u8).await?;

        tokio::time::sleep(self.step_delay()).await;
        ctx.update_progress(100u8).await?;

        Ok(json!({ "succeeded": true }))
    }
}
