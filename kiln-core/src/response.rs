use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ApiError;

/// The response envelope. `$`-prefixed members carry orchestration metadata;
/// everything else is payload.
#[derive(Debug, Default, Serialize)]
pub struct Response {
    #[serde(rename = "$error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    /// Operational values the orchestrator chose because the request left
    /// them unspecified.
    #[serde(rename = "$meta", skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images_base64: Option<Vec<String>>,
    /// Named phase durations in milliseconds.
    #[serde(rename = "$timings", skip_serializing_if = "Option::is_none")]
    pub timings: Option<BTreeMap<String, u128>>,
    #[serde(rename = "$mem_usage", skip_serializing_if = "Option::is_none")]
    pub mem_usage: Option<f64>,
    /// Extra members merged in by training runs and extras.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    pub fn record_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.meta.insert(key.to_string(), value.into());
    }

    /// Attach the encoded outputs: a single image uses the singular member,
    /// more than one the plural.
    pub fn set_images(&mut self, mut images: Vec<String>) {
        if images.len() == 1 {
            self.image_base64 = images.pop();
        } else {
            self.images_base64 = Some(images);
        }
    }
}

impl From<ApiError> for Response {
    fn from(error: ApiError) -> Self {
        Response {
            error: Some(error),
            ..Response::default()
        }
    }
}
