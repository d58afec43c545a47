use std::sync::Arc;

use tracing::{info, warn};

use crate::engine::{GenerationEngine, ModelHandle};
use crate::error::EngineError;
use crate::request::ModelIdentity;

/// The currently resident model.
pub struct LoadedModel {
    pub identity: ModelIdentity,
    pub handle: Box<dyn ModelHandle>,
}

/// Owns the resident model and drives download/load/eviction. At most one
/// model is resident at a time; replacing it releases the previous handle
/// from the compute device so accelerator memory stays bounded.
pub struct ModelCache {
    runtime_downloads: bool,
    current: Option<LoadedModel>,
}

impl ModelCache {
    pub fn new(runtime_downloads: bool) -> Self {
        Self {
            runtime_downloads,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&LoadedModel> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut LoadedModel> {
        self.current.as_mut()
    }

    /// Whether the resident model already matches the normalized target.
    pub fn matches(&self, identity: &ModelIdentity) -> bool {
        self.current
            .as_ref()
            .is_some_and(|loaded| loaded.identity.normalized() == identity.normalized())
    }

    /// Make `identity` the resident model.
    ///
    /// A matching resident model is returned as-is with no I/O. Otherwise
    /// the previous handle is released and evicted, the artifact fetched if
    /// missing and downloads are permitted, and the new handle loaded on a
    /// worker thread. The slot is only written on success; after a failed
    /// switch it stays empty and the next request retries from scratch.
    pub async fn acquire(
        &mut self,
        engine: Arc<dyn GenerationEngine>,
        identity: ModelIdentity,
        pipeline_hint: Option<String>,
    ) -> Result<&mut LoadedModel, EngineError> {
        if self.matches(&identity) {
            // Borrow-checker friendly unwrap of the branch above.
            return Ok(self.current.as_mut().unwrap());
        }

        if let Some(mut previous) = self.current.take() {
            info!(model = %previous.identity, "releasing previous model");
            previous.handle.release();
        }

        if !engine.is_downloaded(&identity) && self.runtime_downloads {
            let download_engine = Arc::clone(&engine);
            let download_identity = identity.clone();
            tokio::task::spawn_blocking(move || download_engine.download(&download_identity))
                .await
                .map_err(|e| EngineError::Failed(format!("download worker failed: {e}")))??;
        }

        info!(model = %identity, "loading model");
        let load_identity = identity.clone();
        let handle = tokio::task::spawn_blocking(move || {
            engine.load(&load_identity, pipeline_hint.as_deref())
        })
        .await
        .map_err(|e| EngineError::Failed(format!("load worker failed: {e}")))?
        .inspect_err(|e| warn!(model = %identity, error = %e, "model load failed"))?;

        Ok(self.current.insert(LoadedModel { identity, handle }))
    }

    /// Drop the resident model, releasing it from the device first.
    pub fn evict(&mut self) {
        if let Some(mut previous) = self.current.take() {
            previous.handle.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingEngine {
        loads: AtomicUsize,
        downloads: AtomicUsize,
        downloaded: Mutex<Vec<String>>,
        fail_load: Mutex<Option<String>>,
    }

    struct NullHandle {
        released: Arc<AtomicUsize>,
    }

    impl ModelHandle for NullHandle {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl GenerationEngine for CountingEngine {
        fn is_downloaded(&self, identity: &ModelIdentity) -> bool {
            self.downloaded
                .lock()
                .unwrap()
                .contains(&identity.normalized())
        }
        fn download(&self, identity: &ModelIdentity) -> Result<(), EngineError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            self.downloaded.lock().unwrap().push(identity.normalized());
            Ok(())
        }
        fn load(
            &self,
            identity: &ModelIdentity,
            _pipeline_hint: Option<&str>,
        ) -> Result<Box<dyn ModelHandle>, EngineError> {
            if self.fail_load.lock().unwrap().as_deref() == Some(identity.id.as_str()) {
                return Err(EngineError::Failed("weights corrupt".to_string()));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullHandle {
                released: Arc::new(AtomicUsize::new(0)),
            }))
        }
        fn pipeline_names(&self) -> Vec<String> {
            vec![]
        }
        fn build_pipeline(
            &self,
            _name: &str,
            _model: &dyn ModelHandle,
            _identity: &ModelIdentity,
        ) -> Option<Box<dyn crate::engine::Pipeline>> {
            None
        }
        fn load_textual_inversion(
            &self,
            _model: &mut dyn ModelHandle,
            _path: &Path,
            _token: Option<&str>,
        ) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn matching_model_is_returned_without_io() {
        let engine = Arc::new(CountingEngine::default());
        let mut cache = ModelCache::new(true);
        let identity = ModelIdentity::new("org/model-a");

        cache
            .acquire(engine.clone(), identity.clone(), None)
            .await
            .unwrap();
        cache
            .acquire(engine.clone(), identity.clone(), None)
            .await
            .unwrap();

        assert_eq!(engine.loads.load(Ordering::SeqCst), 1);
        assert_eq!(engine.downloads.load(Ordering::SeqCst), 1);
        assert!(cache.matches(&identity));
    }

    #[tokio::test]
    async fn downloads_are_skipped_when_disallowed() {
        let engine = Arc::new(CountingEngine::default());
        let mut cache = ModelCache::new(false);
        cache
            .acquire(engine.clone(), ModelIdentity::new("org/model-a"), None)
            .await
            .unwrap();
        assert_eq!(engine.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_switch_leaves_the_slot_empty() {
        let engine = Arc::new(CountingEngine::default());
        let mut cache = ModelCache::new(true);
        let good = ModelIdentity::new("org/model-a");
        cache.acquire(engine.clone(), good.clone(), None).await.unwrap();

        *engine.fail_load.lock().unwrap() = Some("org/model-b".to_string());
        let err = cache
            .acquire(engine.clone(), ModelIdentity::new("org/model-b"), None)
            .await;
        assert!(err.is_err());
        assert!(cache.current().is_none());
        // The partially switched model was never made active.
        assert!(!cache.matches(&ModelIdentity::new("org/model-b")));

        // A retry of the original model loads cleanly.
        *engine.fail_load.lock().unwrap() = None;
        cache.acquire(engine.clone(), good.clone(), None).await.unwrap();
        assert!(cache.matches(&good));
    }
}
