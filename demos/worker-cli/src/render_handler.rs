//! Sample `JobHandler` for the `video.render` job type, demonstrating
//! crash-safe checkpointing through `StepContext`: each step
//! writes a sentinel before doing its (simulated) work and checks for it on
//! entry, so re-invocation after a crash is a no-op rather than redone work.

use async_trait::async_trait;
use renderqueue_core::error::HandlerError;
use renderqueue_core::handler::{JobHandler, StepContext};
use renderqueue_core::job::Job;

pub struct VideoRenderHandler;

#[async_trait]
impl JobHandler for VideoRenderHandler {
    async fn handle(
        &self,
        _job: &Job,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<serde_json::Value>, HandlerError> {
        match ctx.step {
            "fetch_source" => {
                if ctx.get::<bool>("fetch_source.done") == Some(true) {
                    return Ok(Some(serde_json::json!({"cached": true})));
                }
                ctx.set("fetch_source.done", true);
                Ok(Some(serde_json::json!({"bytes_fetched": 0})))
            }
            "render" => {
                if ctx.get::<bool>("render.done") == Some(true) {
                    return Ok(Some(serde_json::json!({"cached": true})));
                }
                ctx.set("render.done", true);
                Ok(Some(serde_json::json!({"frames_rendered": 0})))
            }
            "upload" => {
                if ctx.get::<bool>("upload.done") == Some(true) {
                    return Ok(Some(serde_json::json!({"cached": true})));
                }
                ctx.set("upload.done", true);
                Ok(Some(serde_json::json!({"output_url": "https://example.com/output.mp4"})))
            }
            other => Err(HandlerError::non_retryable(format!("unknown step: {other}"))),
        }
    }
}
