pub mod adapter;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod extras;
pub mod model_cache;
pub mod orchestrator;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod storage;
pub mod telemetry;

pub use adapter::{AdapterManager, AdapterState, CrossAttentionKwargs};
pub use config::DeploymentConfig;
pub use engine::{GenerationEngine, GenerationParams, ModelHandle, Pipeline};
pub use error::{ApiError, EngineError, ErrorCode};
pub use extras::{Extra, ExtraRegistry};
pub use model_cache::{LoadedModel, ModelCache};
pub use orchestrator::Session;
pub use request::{CallInputs, InferenceRequest, LoraSpecs, ModelIdentity, ModelInputs, Precision};
pub use response::Response;
pub use scheduler::{Schedule, SchedulerConfig};
pub use storage::Storage;
pub use telemetry::{EventSink, Heartbeat, ProgressMode, StatusBoard, Timings};
