use std::path::PathBuf;

/// How this process is deployed: which model it serves, where artifacts are
/// cached, and which optional features were enabled.
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    /// Fixed model id for single-model deployments. `None` means the model
    /// is chosen per request (requires `runtime_downloads`).
    pub model_id: Option<String>,
    /// On-disk cache for model weights and adapter artifacts.
    pub models_dir: PathBuf,
    /// Whether missing artifacts may be fetched at request time.
    pub runtime_downloads: bool,
    /// Whether the dreambooth training capability was enabled at startup.
    pub use_dreambooth: bool,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            model_id: None,
            models_dir: PathBuf::from("models"),
            runtime_downloads: true,
            use_dreambooth: false,
        }
    }
}
