//! Payloads the daemon registers out of the box.
//!
//! | Name    | Behaviour                                                    |
//! |---------|--------------------------------------------------------------|
//! | `log`   | Logs `message` from the fire's data at info level            |
//! | `noop`  | Succeeds immediately                                         |
//! | `sleep` | Waits `duration_ms`, failing with `interrupted` if cancelled |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_scheduler::{JobContext, JobError, Payload, PayloadRegistry};
use tracing::info;

struct LogPayload;

#[async_trait]
impl Payload for LogPayload {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        let message = ctx
            .data
            .get("message")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "fired".to_string());
        info!(
            job = %ctx.job_key,
            trigger = %ctx.trigger_key,
            scheduled = %ctx.scheduled_fire_time,
            "{message}"
        );
        Ok(())
    }
}

struct SleepPayload;

#[async_trait]
impl Payload for SleepPayload {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        let ms = match ctx.data.get("duration_ms") {
            Some(v) => v
                .as_i64()
                .and_then(|ms| u64::try_from(ms).ok())
                .ok_or_else(|| JobError::Fatal(format!("duration_ms must be a non-negative integer, got {v}")))?,
            None => 1_000,
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
            _ = ctx.cancel.cancelled() => Err(JobError::Cancelled),
        }
    }
}

pub fn builtin() -> PayloadRegistry {
    let mut registry = PayloadRegistry::new();
    registry.register("log", Arc::new(LogPayload));
    registry.register("sleep", Arc::new(SleepPayload));
    registry.register_fn("noop", |_ctx: JobContext| async { Ok(()) });
    registry
}
