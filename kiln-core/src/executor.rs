use std::panic::AssertUnwindSafe;

use image::DynamicImage;
use tracing::error;

use crate::engine::{GenerationParams, Pipeline};
use crate::telemetry::ProgressMode;

/// A generation failure caught at the recovery boundary: error kind, a
/// human-readable message and a diagnostic trace.
#[derive(Debug)]
pub struct GenerationFailure {
    pub name: String,
    pub message: String,
    pub stack: String,
}

/// Drive one generation call off the async path.
///
/// This is the single recovery boundary for generation: engine errors and
/// panics inside the call are both converted into a [`GenerationFailure`]
/// instead of propagating, and the process stays serviceable afterwards.
/// Nothing below this boundary is retried.
///
/// The pipeline travels to the worker thread and back; `None` in the first
/// slot means it was lost with the worker and must be rebuilt.
pub async fn run(
    mut pipeline: Box<dyn Pipeline>,
    entry_point: Option<String>,
    params: GenerationParams,
    progress: ProgressMode,
) -> (
    Option<Box<dyn Pipeline>>,
    Result<Vec<DynamicImage>, GenerationFailure>,
) {
    let joined = tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let mut on_step = |step: usize| progress.on_step(step);
            pipeline.generate(entry_point.as_deref(), &params, &mut on_step)
        }));
        (pipeline, result)
    })
    .await;

    match joined {
        Ok((pipeline, Ok(Ok(images)))) => (Some(pipeline), Ok(images)),
        Ok((pipeline, Ok(Err(engine_err)))) => {
            error!(error = %engine_err, "generation failed");
            (
                Some(pipeline),
                Err(GenerationFailure {
                    name: "EngineError".to_string(),
                    message: engine_err.to_string(),
                    stack: format!("{engine_err:?}"),
                }),
            )
        }
        Ok((pipeline, Err(panic))) => {
            let message = panic_message(panic.as_ref());
            error!(message, "generation panicked");
            (
                Some(pipeline),
                Err(GenerationFailure {
                    name: "Panic".to_string(),
                    message,
                    stack: std::backtrace::Backtrace::force_capture().to_string(),
                }),
            )
        }
        Err(join_err) => (
            None,
            Err(GenerationFailure {
                name: "WorkerError".to_string(),
                message: join_err.to_string(),
                stack: format!("{join_err:?}"),
            }),
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "generation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::CrossAttentionKwargs;
    use crate::error::EngineError;
    use crate::scheduler::SchedulerConfig;
    use crate::telemetry::StatusBoard;
    use std::path::Path;

    enum Behavior {
        Render(usize),
        Fail,
        Panic,
    }

    struct ScriptedPipeline {
        behavior: Behavior,
    }

    impl Pipeline for ScriptedPipeline {
        fn set_scheduler(&mut self, _config: SchedulerConfig) {}
        fn set_safety_checker(&mut self, _enabled: bool) {}
        fn load_lora_weights(&mut self, _path: &Path) -> Result<(), EngineError> {
            Ok(())
        }
        fn unload_lora_weights(&mut self) {}
        fn set_cross_attention(&mut self, _kwargs: &CrossAttentionKwargs) {}
        fn generate(
            &mut self,
            _entry_point: Option<&str>,
            params: &GenerationParams,
            on_step: &mut (dyn FnMut(usize) + Send),
        ) -> Result<Vec<DynamicImage>, EngineError> {
            match self.behavior {
                Behavior::Render(count) => {
                    for step in 0..params.num_inference_steps {
                        on_step(step);
                    }
                    Ok(vec![DynamicImage::new_rgb8(8, 8); count])
                }
                Behavior::Fail => Err(EngineError::Failed("scripted failure".to_string())),
                Behavior::Panic => panic!("scripted panic"),
            }
        }
    }

    fn pull_mode() -> (StatusBoard, ProgressMode) {
        let board = StatusBoard::default();
        let mode = ProgressMode::Pull {
            status: board.clone(),
            total_steps: 10,
        };
        (board, mode)
    }

    #[tokio::test]
    async fn success_returns_images_and_the_pipeline() {
        let (board, mode) = pull_mode();
        let pipeline = Box::new(ScriptedPipeline {
            behavior: Behavior::Render(2),
        });
        let mut params = GenerationParams::default();
        params.num_inference_steps = 10;
        let (pipeline, result) = run(pipeline, None, params, mode).await;
        assert!(pipeline.is_some());
        assert_eq!(result.unwrap().len(), 2);
        assert!(board.get().progress > 0.8);
    }

    #[tokio::test]
    async fn engine_error_is_caught_with_message_and_trace() {
        let (_, mode) = pull_mode();
        let pipeline = Box::new(ScriptedPipeline {
            behavior: Behavior::Fail,
        });
        let (pipeline, result) = run(pipeline, None, GenerationParams::default(), mode).await;
        assert!(pipeline.is_some());
        let failure = result.unwrap_err();
        assert_eq!(failure.name, "EngineError");
        assert!(failure.message.contains("scripted failure"));
        assert!(!failure.stack.is_empty());
    }

    #[tokio::test]
    async fn panic_is_contained_at_the_boundary() {
        let (_, mode) = pull_mode();
        let pipeline = Box::new(ScriptedPipeline {
            behavior: Behavior::Panic,
        });
        let (pipeline, result) = run(pipeline, None, GenerationParams::default(), mode).await;
        assert!(pipeline.is_some());
        let failure = result.unwrap_err();
        assert_eq!(failure.name, "Panic");
        assert!(failure.message.contains("scripted panic"));
    }
}
