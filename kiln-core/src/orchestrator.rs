use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::adapter::{AdapterManager, AdapterState};
use crate::codec::{self, ImageSource};
use crate::config::DeploymentConfig;
use crate::engine::{GenerationEngine, GenerationParams};
use crate::error::{ApiError, ErrorCode};
use crate::executor;
use crate::extras::ExtraRegistry;
use crate::model_cache::ModelCache;
use crate::pipeline::{PipelineSelector, DEFAULT_PIPELINE};
use crate::request::{
    truncate_inputs, CallInputs, InferenceRequest, ModelIdentity, ModelInputs,
};
use crate::response::Response;
use crate::scheduler::{self, DEFAULT_SCHEDULE};
use crate::telemetry::{EventSink, Heartbeat, ProgressMode, StatusBoard, Timings};

/// Everything one server process mutates while handling requests: the
/// resident model, built pipelines, adapter state, timings and status.
///
/// Correct only under a single-writer regime: at most one request in flight
/// per session, serialized by the caller. State transitions observed by a
/// request are exactly those completed by the immediately preceding one.
pub struct Session {
    config: DeploymentConfig,
    engine: Arc<dyn GenerationEngine>,
    client: reqwest::Client,
    model_cache: ModelCache,
    pipelines: PipelineSelector,
    adapters: AdapterManager,
    adapter_state: AdapterState,
    extras: ExtraRegistry,
    timings: Timings,
    status: StatusBoard,
    init_announced: bool,
}

impl Session {
    pub fn new(engine: Arc<dyn GenerationEngine>, config: DeploymentConfig) -> Self {
        let client = reqwest::Client::new();
        let adapters = AdapterManager::new(config.models_dir.clone(), client.clone());
        let model_cache = ModelCache::new(config.runtime_downloads);
        Self {
            config,
            engine,
            client,
            model_cache,
            pipelines: PipelineSelector::default(),
            adapters,
            adapter_state: AdapterState::default(),
            extras: ExtraRegistry::default(),
            timings: Timings::default(),
            status: StatusBoard::default(),
            init_announced: false,
        }
    }

    pub fn extras_mut(&mut self) -> &mut ExtraRegistry {
        &mut self.extras
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    /// Inspection hook for the adapter-derived cross-attention state.
    pub fn adapter_state(&self) -> &AdapterState {
        &self.adapter_state
    }

    /// Handle one request end to end. `live` is the caller's response
    /// stream for ~1 Hz heartbeats while generation is in flight; it is
    /// cancelled deterministically when this returns.
    pub async fn handle(&mut self, raw: Value, live: Option<mpsc::Sender<String>>) -> Response {
        self.timings.clear();
        self.status.update("start", 0.0);
        if let Ok(logged) = serde_json::to_string(&truncate_inputs(&raw)) {
            info!(request = %logged, "handling request");
        }

        let heartbeat = live.map(|tx| Heartbeat::spawn(self.status.clone(), tx));
        let mut response = match self.handle_inner(&raw).await {
            Ok(response) => response,
            Err(error) => Response::from(error),
        };
        if let Some(heartbeat) = heartbeat {
            heartbeat.cancel();
        }

        let timings = self.timings.drain();
        if !timings.is_empty() {
            response.timings = Some(timings);
        }
        self.status.update("done", 1.0);
        response
    }

    async fn handle_inner(&mut self, raw: &Value) -> Result<Response, ApiError> {
        let request: InferenceRequest = serde_json::from_value(raw.clone())
            .map_err(|_| invalid_inputs(raw))?;
        let (inputs, call) = match (request.model_inputs, request.call_inputs) {
            (Some(inputs), Some(call)) => (inputs, call),
            _ => return Err(invalid_inputs(raw)),
        };

        let mut response = Response::default();
        let sink = EventSink::new(
            self.client.clone(),
            call.send_url.clone(),
            call.start_request_id.clone(),
        );

        // Session startup happens before any sink exists, so the init
        // lifecycle pair goes out on the first request's sink.
        if !self.init_announced {
            self.init_announced = true;
            let mut payload = Map::new();
            if let Some(model_id) = &self.config.model_id {
                payload.insert("model_id".to_string(), json!(model_id));
            }
            self.timings.start("init");
            sink.emit("init", "start", payload.clone());
            self.timings.done("init");
            sink.emit("init", "done", payload);
        }

        if let Some(name) = &call.use_extra {
            let extra = self.extras.get(name).ok_or_else(|| {
                ApiError::new(
                    ErrorCode::NoSuchExtra,
                    format!("Requested \"{name}\" is not a registered extra"),
                )
                .requested(name.clone())
                .available(self.extras.names())
            })?;
            return extra.run(&inputs, &call);
        }

        // Split the target model out of the operational parameters.
        let model_id = match &call.model_id {
            Some(model_id) => model_id.clone(),
            None => {
                let fixed = self.config.model_id.clone().ok_or_else(|| {
                    ApiError::new(
                        ErrorCode::NoModelId,
                        "No callInputs.MODEL_ID specified, nor was a fixed model configured",
                    )
                })?;
                response.record_meta("MODEL_ID", fixed.clone());
                fixed
            }
        };
        if let Some(fixed) = &self.config.model_id {
            if !self.config.runtime_downloads && &model_id != fixed {
                return Err(ApiError::new(
                    ErrorCode::ModelMismatch,
                    format!("Model \"{model_id}\" not available on this server which hosts \"{fixed}\""),
                )
                .requested(model_id)
                .available(fixed.clone()));
            }
        }
        let identity = ModelIdentity {
            id: model_id,
            revision: call.model_revision.clone(),
            precision: call.model_precision,
        };

        // Validate the pipeline name before any model I/O happens for it.
        let pipeline_name = match &call.pipeline {
            Some(name) => name.clone(),
            None => {
                response.record_meta("PIPELINE", DEFAULT_PIPELINE);
                DEFAULT_PIPELINE.to_string()
            }
        };
        let available_pipelines = self.engine.pipeline_names();
        if !available_pipelines.iter().any(|name| name == &pipeline_name) {
            return Err(ApiError::new(
                ErrorCode::NoSuchPipeline,
                format!("\"{pipeline_name}\" is not a known built-in or community pipeline"),
            )
            .requested(pipeline_name)
            .available(available_pipelines));
        }

        self.acquire_model(&identity, &pipeline_name, &sink).await?;

        let scheduler_name = match &call.scheduler {
            Some(name) => name.clone(),
            None => {
                response.record_meta("SCHEDULER", DEFAULT_SCHEDULE.to_string());
                DEFAULT_SCHEDULE.to_string()
            }
        };
        let scheduler_config = scheduler::resolve(self.engine.as_ref(), &identity, &scheduler_name)
            .map_err(|e| {
                ApiError::new(
                    ErrorCode::InvalidScheduler,
                    format!("\"{}\" is not a registered scheduler", e.requested),
                )
                .requested(e.requested)
                .available(e.available)
            })?;

        // Adapters: textual inversions against the model, then LoRAs
        // against the pipeline further down.
        if !call.textual_inversions.is_empty() {
            let model = self
                .model_cache
                .current_mut()
                .ok_or_else(|| pipeline_error("no model resident after acquire"))?;
            self.adapters
                .apply_textual_inversions(
                    &call.textual_inversions,
                    self.engine.as_ref(),
                    model.handle.as_mut(),
                    &self.status,
                )
                .await
                .map_err(|e| pipeline_error(format!("textual inversion failed: {e}")))?;
        }

        let mut params = self.normalize_params(&inputs, &call).await?;

        if call.train.as_deref() == Some("dreambooth") {
            return self.train_dreambooth(response, &identity, &inputs, &call, &sink).await;
        }

        let safety_requested = call.safety_checker.unwrap_or(true);
        let model = self
            .model_cache
            .current()
            .ok_or_else(|| pipeline_error("no model resident after acquire"))?;
        let safety_enabled = safety_requested && model.handle.has_safety_checker();

        let mut pipeline = self
            .pipelines
            .take(
                self.engine.as_ref(),
                &pipeline_name,
                model.handle.as_ref(),
                &identity,
            )
            .map_err(|e| {
                ApiError::new(
                    ErrorCode::NoSuchPipeline,
                    format!("\"{}\" is not a known built-in or community pipeline", e.requested),
                )
                .requested(e.requested)
                .available(e.available)
            })?;
        pipeline.set_scheduler(scheduler_config);
        pipeline.set_safety_checker(safety_enabled);

        let lora_specs = call
            .lora_weights
            .clone()
            .map(|specs| specs.into_vec())
            .unwrap_or_default();
        if let Err(e) = self
            .adapters
            .apply_lora_weights(&lora_specs, pipeline.as_mut(), &mut self.adapter_state)
            .await
        {
            self.pipelines.put_back(&pipeline_name, pipeline);
            return Err(pipeline_error(format!("lora_weights failed: {e}")));
        }

        // Adapter-derived configuration first, request-supplied overrides on
        // top; the overrides are per-request and never persisted.
        let mut cross_attention = self.adapter_state.cross_attention.clone();
        for (key, value) in params.cross_attention.iter() {
            cross_attention.insert(key.clone(), value.clone());
        }
        params.cross_attention = cross_attention;

        let progress = self.progress_mode(&inputs, &params, &sink);

        self.phase_start("inference", &sink);
        self.status.update("inference", 0.0);
        let entry_point = call.custom_pipeline_method.clone();
        let (returned, result) = executor::run(pipeline, entry_point, params, progress).await;
        match returned {
            Some(pipeline) => self.pipelines.put_back(&pipeline_name, pipeline),
            None => {
                // The worker died with the pipeline; adapter state went
                // with it and must be rebuilt on the next request.
                warn!("pipeline lost with its worker thread");
                self.adapter_state.reset();
            }
        }
        self.phase_done("inference", &sink);

        let images = result.map_err(|failure| {
            ApiError::new(ErrorCode::PipelineError, failure.message)
                .named(failure.name)
                .stack(failure.stack)
        })?;

        let mut encoded = Vec::with_capacity(images.len());
        for image in &images {
            encoded.push(
                codec::encode_png_base64(image)
                    .map_err(|e| pipeline_error(format!("output encoding failed: {e}")))?,
            );
        }
        response.set_images(encoded);
        response.mem_usage = self.engine.mem_usage();
        Ok(response)
    }

    /// Ensure the requested model is resident, clearing pipeline and adapter
    /// state first when it changes. The cache slot is only written on a
    /// successful load.
    async fn acquire_model(
        &mut self,
        identity: &ModelIdentity,
        pipeline_hint: &str,
        sink: &EventSink,
    ) -> Result<(), ApiError> {
        if self.model_cache.matches(identity) {
            return Ok(());
        }
        self.pipelines.clear();
        self.adapter_state.reset();
        self.status.update("loadModel", 0.0);
        self.phase_start("loadModel", sink);
        // Discard the handle borrow before the next `&mut self` use.
        let result = self
            .model_cache
            .acquire(
                Arc::clone(&self.engine),
                identity.clone(),
                Some(pipeline_hint.to_string()),
            )
            .await
            .map(|_| ());
        self.phase_done("loadModel", sink);
        result.map_err(|e| pipeline_error(format!("model load failed: {e}")))
    }

    /// Decode embedded images, validate request-supplied cross-attention
    /// arguments and run the masked-generation preprocessing path.
    async fn normalize_params(
        &self,
        inputs: &ModelInputs,
        call: &CallInputs,
    ) -> Result<GenerationParams, ApiError> {
        let mut params = GenerationParams::from_inputs(inputs);

        let source = if call.is_url.unwrap_or(false) {
            ImageSource::Url
        } else {
            ImageSource::Embedded
        };
        let decode = |payload: &Option<String>, name: &'static str| {
            let payload = payload.clone();
            async move {
                match payload {
                    Some(payload) => codec::decode(&payload, name, source, &self.client)
                        .await
                        .map(Some)
                        .map_err(|e| ApiError::new(ErrorCode::InvalidInputs, e.to_string())),
                    None => Ok(None),
                }
            }
        };
        params.init_image = decode(&inputs.init_image, "init_image").await?;
        params.image = decode(&inputs.image, "image").await?;
        params.mask_image = decode(&inputs.mask_image, "mask_image").await?;
        if let Some(instance_images) = &inputs.instance_images {
            for payload in instance_images {
                let image =
                    codec::decode(payload, "instance_image", source, &self.client)
                        .await
                        .map_err(|e| ApiError::new(ErrorCode::InvalidInputs, e.to_string()))?;
                params.instance_images.push(image);
            }
        }

        if let Some(kwargs) = &inputs.cross_attention_kwargs {
            let parsed: Option<Map<String, Value>> = match kwargs {
                Value::Object(map) => Some(map.clone()),
                Value::String(text) => serde_json::from_str::<Map<String, Value>>(text).ok(),
                _ => None,
            };
            let map = parsed.ok_or_else(|| {
                ApiError::new(
                    ErrorCode::InvalidCrossAttentionKwargs,
                    "`cross_attention_kwargs` should be an object or a JSON-encoded string",
                )
            })?;
            params.cross_attention.extend(map);
        }

        if call.fill_mode.as_deref() == Some("patchmatch") {
            codec::patch_fill_preprocess(self.engine.as_ref(), &mut params)
                .map_err(|e| pipeline_error(format!("patch fill preprocessing failed: {e}")))?;
        }

        Ok(params)
    }

    /// Delegate a dreambooth run to the engine's training capability.
    async fn train_dreambooth(
        &mut self,
        mut response: Response,
        identity: &ModelIdentity,
        inputs: &ModelInputs,
        call: &CallInputs,
        sink: &EventSink,
    ) -> Result<Response, ApiError> {
        if !self.config.use_dreambooth {
            return Err(ApiError::new(
                ErrorCode::TrainDreamboothNotAvailable,
                "Called with callInputs { train: \"dreambooth\" } but this server was started without training support",
            ));
        }
        self.phase_start("training", sink);
        let engine = Arc::clone(&self.engine);
        let identity = identity.clone();
        let inputs = inputs.clone();
        let call = call.clone();
        let result = tokio::task::spawn_blocking(move || {
            engine.train_dreambooth(&identity, &inputs, &call)
        })
        .await
        .map_err(|e| pipeline_error(format!("training worker failed: {e}")));
        self.phase_done("training", sink);
        let trained = result?.map_err(|e| pipeline_error(format!("training failed: {e}")))?;
        response.extra.extend(trained);
        Ok(response)
    }

    /// Push mode when the request asked for a step interval, pull mode
    /// (status board + heartbeat) otherwise.
    fn progress_mode(
        &self,
        inputs: &ModelInputs,
        params: &GenerationParams,
        sink: &EventSink,
    ) -> ProgressMode {
        match inputs.callback_steps {
            Some(every) if every > 0 => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let sink = sink.clone();
                tokio::spawn(async move {
                    while let Some(step) = rx.recv().await {
                        sink.progress(step);
                    }
                });
                ProgressMode::Push { every, steps: tx }
            }
            _ => ProgressMode::Pull {
                status: self.status.clone(),
                total_steps: params.num_inference_steps,
            },
        }
    }

    fn phase_start(&mut self, phase: &str, sink: &EventSink) {
        self.timings.start(phase);
        sink.emit(phase, "start", Map::new());
    }

    fn phase_done(&mut self, phase: &str, sink: &EventSink) {
        self.timings.done(phase);
        sink.emit(phase, "done", Map::new());
    }
}

fn invalid_inputs(raw: &Value) -> ApiError {
    ApiError::new(
        ErrorCode::InvalidInputs,
        format!(
            "Expecting an object like {{ modelInputs: {{}}, callInputs: {{}} }} but got {}",
            serde_json::to_string(&truncate_inputs(raw)).unwrap_or_else(|_| "<unserializable>".into())
        ),
    )
}

fn pipeline_error(message: impl std::fmt::Display) -> ApiError {
    ApiError::new(ErrorCode::PipelineError, message.to_string())
}

// Convenience for tests and embedders that want a plain JSON value back.
impl Session {
    pub async fn handle_value(&mut self, raw: Value) -> Value {
        let response = self.handle(raw, None).await;
        serde_json::to_value(&response).unwrap_or_else(|_| json!({}))
    }
}
