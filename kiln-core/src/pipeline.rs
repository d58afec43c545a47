use std::collections::HashMap;

use tracing::debug;

use crate::engine::{GenerationEngine, ModelHandle, Pipeline};
use crate::request::ModelIdentity;

/// Pipeline chosen when the request names none: auto-select by task.
pub const DEFAULT_PIPELINE: &str = "AutoPipelineForText2Image";

/// The requested name is not a pipeline the engine can build.
#[derive(Debug, thiserror::Error)]
#[error("\"{requested}\" is not a known pipeline")]
pub struct UnknownPipeline {
    pub requested: String,
    pub available: Vec<String>,
}

/// Resolves named pipelines for the resident model, caching built instances
/// until the model changes. The cache also carries each pipeline's attached
/// adapter state between requests, which is why a model switch must clear it.
#[derive(Default)]
pub struct PipelineSelector {
    built: HashMap<String, Box<dyn Pipeline>>,
}

impl PipelineSelector {
    /// Take the named pipeline out of the selector, building it on first
    /// use. Callers return it with [`put_back`](Self::put_back) after the
    /// generation call; ownership moves to the worker thread in between.
    pub fn take(
        &mut self,
        engine: &dyn GenerationEngine,
        name: &str,
        model: &dyn ModelHandle,
        identity: &ModelIdentity,
    ) -> Result<Box<dyn Pipeline>, UnknownPipeline> {
        if let Some(pipeline) = self.built.remove(name) {
            debug!(name, "reusing cached pipeline");
            return Ok(pipeline);
        }
        engine
            .build_pipeline(name, model, identity)
            .ok_or_else(|| UnknownPipeline {
                requested: name.to_string(),
                available: engine.pipeline_names(),
            })
    }

    pub fn put_back(&mut self, name: &str, pipeline: Box<dyn Pipeline>) {
        self.built.insert(name.to_string(), pipeline);
    }

    /// Drop every built pipeline. Required on model switch.
    pub fn clear(&mut self) {
        self.built.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.built.is_empty()
    }
}
