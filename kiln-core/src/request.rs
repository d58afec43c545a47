use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Numeric precision a model is loaded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp16,
    Fp32,
}

serde_plain::derive_display_from_serialize!(Precision);
serde_plain::derive_fromstr_from_deserialize!(Precision);

/// Identity of one generative model: id plus the revision/precision the
/// weights were materialized with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelIdentity {
    pub id: String,
    pub revision: Option<String>,
    pub precision: Option<Precision>,
}

impl ModelIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: None,
            precision: None,
        }
    }

    /// Filesystem-safe name, stable across requests for the same target.
    /// Repo separators become `--` and a pinned revision is appended.
    pub fn normalized(&self) -> String {
        let mut name = self.id.replace('/', "--");
        if let Some(revision) = &self.revision {
            name.push_str("--");
            name.push_str(revision);
        }
        name
    }
}

impl std::fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.normalized())
    }
}

/// One or many LoRA weight locators; the wire format accepts both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoraSpecs {
    One(String),
    Many(Vec<String>),
}

impl LoraSpecs {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            LoraSpecs::One(spec) => vec![spec],
            LoraSpecs::Many(specs) => specs,
        }
    }
}

/// Generation parameters as they arrive on the wire. Embedded images are
/// still encoded strings here; the codec decodes them during normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInputs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_images_per_prompt: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// When set, a progress event is pushed to the network sink every
    /// `callback_steps` sampling steps instead of updating the status board.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_attention_kwargs: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Operational parameters steering the orchestrator rather than the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallInputs {
    #[serde(rename = "MODEL_ID", skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(rename = "MODEL_REVISION", skip_serializing_if = "Option::is_none")]
    pub model_revision: Option<String>,
    #[serde(rename = "MODEL_PRECISION", skip_serializing_if = "Option::is_none")]
    pub model_precision: Option<Precision>,
    #[serde(rename = "PIPELINE", skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(rename = "SCHEDULER", skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(rename = "FILL_MODE", skip_serializing_if = "Option::is_none")]
    pub fill_mode: Option<String>,
    #[serde(rename = "SEND_URL", skip_serializing_if = "Option::is_none")]
    pub send_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_weights: Option<LoraSpecs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub textual_inversions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_checker: Option<bool>,
    /// Embedded images are URLs to fetch rather than base64 payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_url: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_pipeline_method: Option<String>,
    #[serde(rename = "startRequestId", skip_serializing_if = "Option::is_none")]
    pub start_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_extra: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train: Option<String>,
}

/// The envelope every call arrives in. Both groups are required; a missing
/// group is an `INVALID_INPUTS` response, not a transport error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InferenceRequest {
    #[serde(rename = "modelInputs")]
    pub model_inputs: Option<ModelInputs>,
    #[serde(rename = "callInputs")]
    pub call_inputs: Option<CallInputs>,
}

/// Clone of the raw request body with embedded image payloads shortened to a
/// prefix, safe to log.
pub fn truncate_inputs(raw: &Value) -> Value {
    let mut clone = raw.clone();
    if let Some(model_inputs) = clone.get_mut("modelInputs").and_then(Value::as_object_mut) {
        for key in ["init_image", "mask_image", "image", "input_image"] {
            if let Some(Value::String(payload)) = model_inputs.get_mut(key) {
                truncate_payload(payload);
            }
        }
        if let Some(Value::Array(images)) = model_inputs.get_mut("instance_images") {
            for image in images {
                if let Value::String(payload) = image {
                    truncate_payload(payload);
                }
            }
        }
    }
    clone
}

fn truncate_payload(payload: &mut String) {
    // Cut on a char boundary; byte 6 may fall inside a multi-byte char.
    if let Some((index, _)) = payload.char_indices().nth(6) {
        payload.truncate(index);
        payload.push_str("...");
    }
}
