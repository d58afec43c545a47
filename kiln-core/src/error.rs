use serde::Serialize;

/// Wire-level error codes returned under `$error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInputs,
    NoModelId,
    ModelMismatch,
    NoSuchPipeline,
    InvalidScheduler,
    InvalidCrossAttentionKwargs,
    PipelineError,
    NoSuchExtra,
    TrainDreamboothNotAvailable,
}

serde_plain::derive_display_from_serialize!(ErrorCode);

/// Structured error payload serialized as the `$error` member of a response.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            name: None,
            requested: None,
            available: None,
            stack: None,
        }
    }

    pub fn requested(mut self, requested: impl Into<String>) -> Self {
        self.requested = Some(requested.into());
        self
    }

    pub fn available(mut self, available: impl Serialize) -> Self {
        self.available = serde_json::to_value(available).ok();
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Failures surfaced by a [`GenerationEngine`](crate::engine::GenerationEngine)
/// implementation. Everything the orchestrator cannot classify further is
/// reported as `PIPELINE_ERROR` at the recovery boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model artifact not present locally: {0}")]
    NotDownloaded(String),
    #[error("no pipeline entry point named \"{0}\"")]
    NoSuchEntryPoint(String),
    #[error("capability not available: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

/// Failures resolving or fetching an adapter artifact.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("unrecognized storage locator: {0}")]
    Unrecognized(String),
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures decoding an image payload at the request boundary.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 payload for \"{name}\": {reason}")]
    Base64 { name: String, reason: String },
    #[error("could not decode image \"{name}\": {reason}")]
    Image { name: String, reason: String },
    #[error("could not fetch image \"{name}\" from url: {reason}")]
    Fetch { name: String, reason: String },
}
