use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ApiError;
use crate::request::{CallInputs, ModelInputs};
use crate::response::Response;

/// A named auxiliary capability invoked instead of generation, e.g. an
/// upscaler. Handlers run before any model or adapter state is touched.
pub trait Extra: Send + Sync {
    fn run(&self, model_inputs: &ModelInputs, call_inputs: &CallInputs)
        -> Result<Response, ApiError>;
}

/// Registry mapping extra names to handlers. An unknown name is a typed
/// NotFound carrying every registered name, never a lookup failure.
#[derive(Default)]
pub struct ExtraRegistry {
    handlers: BTreeMap<String, Arc<dyn Extra>>,
}

impl ExtraRegistry {
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Extra>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Extra>> {
        self.handlers.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Extra for Echo {
        fn run(
            &self,
            _model_inputs: &ModelInputs,
            _call_inputs: &CallInputs,
        ) -> Result<Response, ApiError> {
            let mut response = Response::default();
            response.record_meta("extra", "echo");
            Ok(response)
        }
    }

    #[test]
    fn registered_names_are_enumerable() {
        let mut registry = ExtraRegistry::default();
        registry.register("echo", Arc::new(Echo));
        registry.register("upsample", Arc::new(Echo));
        assert_eq!(registry.names(), vec!["echo", "upsample"]);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("resize").is_none());
    }
}
