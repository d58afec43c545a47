use std::any::Any;
use std::path::Path;

use image::{DynamicImage, GrayImage, RgbImage};
use serde_json::{Map, Value};

use crate::adapter::CrossAttentionKwargs;
use crate::error::EngineError;
use crate::request::{CallInputs, ModelIdentity, ModelInputs};
use crate::scheduler::SchedulerConfig;

/// Normalized generation parameters handed to a pipeline. Embedded images
/// have already been decoded and preprocessing (mask fill) applied.
#[derive(Debug, Default, Clone)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub strength: Option<f64>,
    pub num_images_per_prompt: usize,
    /// Absent means the engine seeds itself.
    pub seed: Option<u64>,
    pub init_image: Option<DynamicImage>,
    pub image: Option<DynamicImage>,
    pub mask_image: Option<DynamicImage>,
    pub instance_images: Vec<DynamicImage>,
    pub cross_attention: CrossAttentionKwargs,
    /// Parameters the orchestrator does not interpret, forwarded verbatim.
    pub extra: Map<String, Value>,
}

impl GenerationParams {
    pub fn from_inputs(inputs: &ModelInputs) -> Self {
        GenerationParams {
            prompt: inputs.prompt.clone().unwrap_or_default(),
            negative_prompt: inputs.negative_prompt.clone(),
            width: inputs.width,
            height: inputs.height,
            num_inference_steps: inputs.num_inference_steps.unwrap_or(50),
            guidance_scale: inputs.guidance_scale.unwrap_or(7.5),
            strength: inputs.strength,
            num_images_per_prompt: inputs.num_images_per_prompt.unwrap_or(1),
            seed: inputs.seed,
            init_image: None,
            image: None,
            mask_image: None,
            instance_images: Vec::new(),
            cross_attention: CrossAttentionKwargs::new(),
            extra: inputs.extra.clone(),
        }
    }
}

/// Resident weights for one model. Exclusively owned by the model cache;
/// `release` moves them off the compute device before the handle is dropped.
pub trait ModelHandle: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Move the weights off the accelerator. Called exactly once, when the
    /// cache replaces this handle.
    fn release(&mut self);

    fn has_safety_checker(&self) -> bool {
        false
    }
}

/// A configured execution graph bound to one model. Holds the scheduler,
/// safety-checker toggle and adapter state the orchestrator configures
/// between requests.
pub trait Pipeline: Send + Sync {
    fn set_scheduler(&mut self, config: SchedulerConfig);

    fn set_safety_checker(&mut self, enabled: bool);

    fn load_lora_weights(&mut self, path: &Path) -> Result<(), EngineError>;

    fn unload_lora_weights(&mut self);

    fn set_cross_attention(&mut self, kwargs: &CrossAttentionKwargs);

    /// Run one generation. `entry_point` substitutes a custom sampling
    /// procedure when set; `on_step` is invoked after every sampling step.
    /// This is a blocking call and is always driven off the async path.
    fn generate(
        &mut self,
        entry_point: Option<&str>,
        params: &GenerationParams,
        on_step: &mut (dyn FnMut(usize) + Send),
    ) -> Result<Vec<DynamicImage>, EngineError>;
}

/// The opaque generation capability the orchestrator drives. Implementations
/// own all tensor math, weight formats and download mechanics.
pub trait GenerationEngine: Send + Sync {
    /// Whether the weights for `identity` are already materialized locally.
    fn is_downloaded(&self, identity: &ModelIdentity) -> bool;

    /// Fetch the weights for `identity`. Blocking; run on a worker thread.
    fn download(&self, identity: &ModelIdentity) -> Result<(), EngineError>;

    /// Load `identity` into memory. Blocking; run on a worker thread.
    fn load(
        &self,
        identity: &ModelIdentity,
        pipeline_hint: Option<&str>,
    ) -> Result<Box<dyn ModelHandle>, EngineError>;

    /// Every pipeline name this engine can build, built-in and
    /// community-registered alike.
    fn pipeline_names(&self) -> Vec<String>;

    /// Build the named pipeline for a loaded model, or `None` when the name
    /// is not in [`pipeline_names`](Self::pipeline_names).
    fn build_pipeline(
        &self,
        name: &str,
        model: &dyn ModelHandle,
        identity: &ModelIdentity,
    ) -> Option<Box<dyn Pipeline>>;

    /// Model-specific sampling-schedule parameters (trained noise schedule
    /// and friends), re-derived per model.
    fn schedule_params(&self, identity: &ModelIdentity) -> Value {
        let _ = identity;
        Value::Null
    }

    /// Inject a learned token embedding into the model's vocabulary.
    fn load_textual_inversion(
        &self,
        model: &mut dyn ModelHandle,
        path: &Path,
        token: Option<&str>,
    ) -> Result<(), EngineError>;

    /// Patch-based inpainting used by the masked-generation preprocessing
    /// path. `None` when the engine was built without the capability.
    fn patch_fill(&self, image: &RgbImage, mask: &GrayImage) -> Option<Result<RgbImage, EngineError>> {
        let _ = (image, mask);
        None
    }

    /// Fine-tune the current model. Only reachable when the deployment
    /// enables training; the result map is merged into the response.
    fn train_dreambooth(
        &self,
        identity: &ModelIdentity,
        model_inputs: &ModelInputs,
        call_inputs: &CallInputs,
    ) -> Result<Map<String, Value>, EngineError> {
        let _ = (identity, model_inputs, call_inputs);
        Err(EngineError::Unsupported("dreambooth training"))
    }

    /// Fraction of accelerator memory currently allocated, when known.
    fn mem_usage(&self) -> Option<f64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_default_the_sampling_knobs() {
        let inputs: ModelInputs = serde_json::from_value(json!({ "prompt": "a kiln" })).unwrap();
        let params = GenerationParams::from_inputs(&inputs);
        assert_eq!(params.num_inference_steps, 50);
        assert_eq!(params.guidance_scale, 7.5);
        assert_eq!(params.num_images_per_prompt, 1);
        assert!(params.seed.is_none());
    }

    #[test]
    fn unknown_inputs_are_forwarded_verbatim() {
        let inputs: ModelInputs =
            serde_json::from_value(json!({ "prompt": "x", "eta": 0.3 })).unwrap();
        let params = GenerationParams::from_inputs(&inputs);
        assert_eq!(params.extra["eta"], json!(0.3));
    }
}
