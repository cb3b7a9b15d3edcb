//! Unified Inference Common Types
//!
//! Shared types used by the orchestrator and by clients of its HTTP surface.

pub mod error;
pub mod model;
pub mod status;

pub use error::{ErrorCode, ErrorDetail, ErrorResponse};
pub use model::{BackendKind, ExecutionMode, ModelFormat, ModelList, ModelProjection, ModelType};
pub use status::{BackendStatusSnapshot, HealthResponse, LifecycleState, StatusResponse};
