use std::any::Any;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use kiln_core::adapter::CrossAttentionKwargs;
use kiln_core::engine::{GenerationEngine, GenerationParams, ModelHandle, Pipeline};
use kiln_core::error::EngineError;
use kiln_core::request::ModelIdentity;
use kiln_core::scheduler::SchedulerConfig;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::info;

const PIPELINES: &[&str] = &[
    "AutoPipelineForText2Image",
    "StableDiffusionPipeline",
    "StableDiffusionImg2ImgPipeline",
    "StableDiffusionInpaintPipeline",
    "StableDiffusionXLPipeline",
];

/// A deterministic software renderer behind the engine contract. Useful for
/// local development and integration tests: no weights, no accelerator, but
/// the full lifecycle (download markers, load/release, adapters, progress).
pub struct TestPatternEngine {
    models_dir: PathBuf,
}

impl TestPatternEngine {
    pub fn new(models_dir: PathBuf) -> Self {
        Self { models_dir }
    }

    fn model_dir(&self, identity: &ModelIdentity) -> PathBuf {
        self.models_dir.join(identity.normalized())
    }

    fn marker(&self, identity: &ModelIdentity) -> PathBuf {
        self.model_dir(identity).join("model_index.json")
    }
}

struct TestModel {
    identity: ModelIdentity,
    on_device: bool,
    inversions: Vec<String>,
}

impl ModelHandle for TestModel {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn release(&mut self) {
        self.on_device = false;
        info!(model = %self.identity, "released test model");
    }

    fn has_safety_checker(&self) -> bool {
        true
    }
}

struct TestPipeline {
    name: String,
    model: String,
    scheduler: Option<SchedulerConfig>,
    safety_checker: bool,
    loras: Vec<PathBuf>,
    cross_attention: CrossAttentionKwargs,
}

impl TestPipeline {
    fn render(&self, params: &GenerationParams, index: usize) -> DynamicImage {
        let width = params.width.unwrap_or(512);
        let height = params.height.unwrap_or(512);
        let seed = params.seed.unwrap_or_else(|| {
            let digest = Sha256::digest(params.prompt.as_bytes());
            u64::from_le_bytes(digest[..8].try_into().unwrap_or_default())
        });
        let tint = (seed.rotate_left(index as u32 * 8) & 0xff) as u8;
        let image = RgbImage::from_fn(width, height, |x, y| {
            let r = ((x * 255) / width.max(1)) as u8;
            let g = ((y * 255) / height.max(1)) as u8;
            Rgb([r ^ tint, g, tint])
        });
        DynamicImage::ImageRgb8(image)
    }
}

impl Pipeline for TestPipeline {
    fn set_scheduler(&mut self, config: SchedulerConfig) {
        self.scheduler = Some(config);
    }

    fn set_safety_checker(&mut self, enabled: bool) {
        self.safety_checker = enabled;
    }

    fn load_lora_weights(&mut self, path: &Path) -> Result<(), EngineError> {
        if !path.exists() {
            return Err(EngineError::NotDownloaded(path.display().to_string()));
        }
        self.loras.push(path.to_path_buf());
        Ok(())
    }

    fn unload_lora_weights(&mut self) {
        self.loras.clear();
    }

    fn set_cross_attention(&mut self, kwargs: &CrossAttentionKwargs) {
        self.cross_attention = kwargs.clone();
    }

    fn generate(
        &mut self,
        entry_point: Option<&str>,
        params: &GenerationParams,
        on_step: &mut (dyn FnMut(usize) + Send),
    ) -> Result<Vec<DynamicImage>, EngineError> {
        match entry_point {
            None | Some("__call__") => {}
            Some(other) => return Err(EngineError::NoSuchEntryPoint(other.to_string())),
        }
        info!(
            pipeline = %self.name,
            model = %self.model,
            prompt = %params.prompt,
            scheduler = self.scheduler.as_ref().map(|config| config.schedule.to_string()),
            safety_checker = self.safety_checker,
            loras = self.loras.len(),
            scale = ?self.cross_attention.get("scale"),
            "rendering test pattern"
        );
        for step in 0..params.num_inference_steps {
            on_step(step);
        }
        Ok((0..params.num_images_per_prompt)
            .map(|index| self.render(params, index))
            .collect())
    }
}

impl GenerationEngine for TestPatternEngine {
    fn is_downloaded(&self, identity: &ModelIdentity) -> bool {
        self.marker(identity).exists()
    }

    fn download(&self, identity: &ModelIdentity) -> Result<(), EngineError> {
        std::fs::create_dir_all(self.model_dir(identity))?;
        let index = json!({
            "model": identity.id,
            "revision": identity.revision,
            "precision": identity.precision.map(|p| p.to_string()),
        });
        std::fs::write(self.marker(identity), index.to_string())?;
        info!(model = %identity, "materialized test model");
        Ok(())
    }

    fn load(
        &self,
        identity: &ModelIdentity,
        _pipeline_hint: Option<&str>,
    ) -> Result<Box<dyn ModelHandle>, EngineError> {
        if !self.is_downloaded(identity) {
            return Err(EngineError::NotDownloaded(identity.normalized()));
        }
        Ok(Box::new(TestModel {
            identity: identity.clone(),
            on_device: true,
            inversions: Vec::new(),
        }))
    }

    fn pipeline_names(&self) -> Vec<String> {
        PIPELINES.iter().map(|name| name.to_string()).collect()
    }

    fn build_pipeline(
        &self,
        name: &str,
        model: &dyn ModelHandle,
        identity: &ModelIdentity,
    ) -> Option<Box<dyn Pipeline>> {
        if !PIPELINES.contains(&name) {
            return None;
        }
        let model = model.as_any().downcast_ref::<TestModel>()?;
        if !model.on_device {
            return None;
        }
        info!(name, inversions = model.inversions.len(), "building pipeline");
        Some(Box::new(TestPipeline {
            name: name.to_string(),
            model: identity.normalized(),
            scheduler: None,
            safety_checker: true,
            loras: Vec::new(),
            cross_attention: CrossAttentionKwargs::new(),
        }))
    }

    fn schedule_params(&self, identity: &ModelIdentity) -> Value {
        json!({
            "model": identity.normalized(),
            "num_train_timesteps": 1000,
            "beta_start": 0.00085,
            "beta_end": 0.012,
        })
    }

    fn load_textual_inversion(
        &self,
        model: &mut dyn ModelHandle,
        path: &Path,
        token: Option<&str>,
    ) -> Result<(), EngineError> {
        if !path.exists() {
            return Err(EngineError::NotDownloaded(path.display().to_string()));
        }
        let model = model
            .as_any_mut()
            .downcast_mut::<TestModel>()
            .ok_or(EngineError::Unsupported("foreign model handle"))?;
        model
            .inversions
            .push(token.unwrap_or("<embedding>").to_string());
        Ok(())
    }

    fn patch_fill(
        &self,
        image: &RgbImage,
        mask: &GrayImage,
    ) -> Option<Result<RgbImage, EngineError>> {
        // Average-color fill: enough to exercise the preprocessing path.
        let mut sums = [0u64; 3];
        let mut kept = 0u64;
        for (pixel, mask_pixel) in image.pixels().zip(mask.pixels()) {
            if mask_pixel[0] < 128 {
                for (sum, channel) in sums.iter_mut().zip(pixel.0) {
                    *sum += u64::from(channel);
                }
                kept += 1;
            }
        }
        let mean = Rgb(sums.map(|sum| (sum / kept.max(1)) as u8));
        let mut filled = image.clone();
        for (pixel, mask_pixel) in filled.pixels_mut().zip(mask.pixels()) {
            if mask_pixel[0] >= 128 {
                *pixel = mean;
            }
        }
        Some(Ok(filled))
    }

    fn train_dreambooth(
        &self,
        identity: &ModelIdentity,
        model_inputs: &kiln_core::request::ModelInputs,
        _call_inputs: &kiln_core::request::CallInputs,
    ) -> Result<Map<String, Value>, EngineError> {
        let instance_count = model_inputs
            .instance_images
            .as_ref()
            .map_or(0, |images| images.len());
        let mut result = Map::new();
        result.insert("trained_model".to_string(), json!(identity.normalized()));
        result.insert("instance_images".to_string(), json!(instance_count));
        Ok(result)
    }
}
