use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::engine::{GenerationEngine, ModelHandle, Pipeline};
use crate::error::StorageError;
use crate::storage::Storage;
use crate::telemetry::StatusBoard;

/// Cross-attention configuration derived from the applied adapters, merged
/// into the generation parameters.
pub type CrossAttentionKwargs = BTreeMap<String, Value>;

/// The last-applied adapter set. Reset whenever the active model changes.
#[derive(Debug, Default)]
pub struct AdapterState {
    /// Serialized spec list of the last successful LoRA application.
    /// Order-sensitive equality decides whether a request is a no-op.
    last_lora_weights: Option<String>,
    pub cross_attention: CrossAttentionKwargs,
}

impl AdapterState {
    pub fn reset(&mut self) {
        self.last_lora_weights = None;
        self.cross_attention.clear();
    }

    pub fn last_applied(&self) -> Option<&str> {
        self.last_lora_weights.as_deref()
    }
}

/// Applies LoRA weight sets and textual inversions, resolving their source
/// locators through an on-disk content-addressed cache.
pub struct AdapterManager {
    models_dir: PathBuf,
    client: reqwest::Client,
}

impl AdapterManager {
    pub fn new(models_dir: PathBuf, client: reqwest::Client) -> Self {
        Self { models_dir, client }
    }

    /// Re-applied on every request that includes specs; applying the same
    /// embedding twice is harmless. Artifacts are cached on disk, so only
    /// the first request per spec downloads anything.
    pub async fn apply_textual_inversions(
        &self,
        specs: &[String],
        engine: &dyn GenerationEngine,
        model: &mut dyn ModelHandle,
        status: &StatusBoard,
    ) -> Result<(), StorageError> {
        for (index, spec) in specs.iter().enumerate() {
            let Some(storage) = Storage::parse(spec) else {
                // Known gap: unrecognized locators are skipped, not raised.
                warn!(spec, "unrecognized textual inversion locator, skipping");
                continue;
            };
            status.update("textual_inversions", index as f32 / specs.len() as f32);
            let path = self
                .models_dir
                .join(storage.cache_filename(spec, "textual_inversion"));
            if !path.exists() {
                storage.download_to(&self.client, &path).await?;
            }
            engine
                .load_textual_inversion(model, &path, storage.token.as_deref())
                .map_err(|e| StorageError::Download {
                    url: storage.url.clone(),
                    reason: e.to_string(),
                })?;
            debug!(spec, path = %path.display(), "textual inversion applied");
        }
        Ok(())
    }

    /// Apply a LoRA weight set to the pipeline.
    ///
    /// Byte-identical spec lists are a no-op. On any change the previous set
    /// is unloaded first, the cross-attention configuration rebuilt from
    /// scratch, and the new serialized list recorded only after every spec
    /// applied successfully.
    pub async fn apply_lora_weights(
        &self,
        specs: &[String],
        pipeline: &mut dyn Pipeline,
        state: &mut AdapterState,
    ) -> Result<(), StorageError> {
        let serialized = serde_json::to_string(specs).unwrap_or_default();
        if state.last_lora_weights.as_deref() == Some(serialized.as_str()) {
            debug!("no changes to LoRAs since last call");
            return Ok(());
        }

        if let Some(previous) = &state.last_lora_weights {
            if previous != "[]" {
                info!("unloading previous LoRA weights");
                pipeline.unload_lora_weights();
            }
        }
        state.last_lora_weights = None;
        state.cross_attention.clear();

        let mut applied = 0usize;
        for spec in specs {
            let Some(storage) = Storage::parse(spec) else {
                // Known gap: unrecognized locators are skipped, not raised.
                warn!(spec, "unrecognized LoRA locator, skipping");
                continue;
            };
            if let Err(error) = self.apply_one_lora(&storage, spec, pipeline, state).await {
                // Roll back the partial application so the pipeline matches
                // the cleared state a retry starts from.
                if applied > 0 {
                    pipeline.unload_lora_weights();
                }
                state.cross_attention.clear();
                return Err(error);
            }
            applied += 1;
        }

        state.last_lora_weights = Some(serialized);
        pipeline.set_cross_attention(&state.cross_attention);
        Ok(())
    }

    async fn apply_one_lora(
        &self,
        storage: &Storage,
        spec: &str,
        pipeline: &mut dyn Pipeline,
        state: &mut AdapterState,
    ) -> Result<(), StorageError> {
        let scale = storage.scale.unwrap_or(1.0);
        if let Some(previous) = state.cross_attention.insert("scale".to_string(), json!(scale)) {
            if previous != json!(scale) {
                warn!(%previous, scale, "LoRA scale overwrites an earlier adapter's scale");
            }
        }
        let path = self
            .models_dir
            .join(storage.cache_filename(spec, "lora_weights"));
        if !path.exists() {
            storage.download_to(&self.client, &path).await?;
        }
        info!(spec, path = %path.display(), "loading lora_weights");
        pipeline
            .load_lora_weights(&path)
            .map_err(|e| StorageError::Download {
                url: storage.url.clone(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_everything() {
        let mut state = AdapterState {
            last_lora_weights: Some("[\"x\"]".to_string()),
            cross_attention: CrossAttentionKwargs::from([("scale".to_string(), json!(0.5))]),
        };
        state.reset();
        assert!(state.last_applied().is_none());
        assert!(state.cross_attention.is_empty());
    }
}
