//! Request routing: pick a model, pick a backend, forward.

mod offload;
mod proxy;
mod selector;

pub use offload::{OffloadPolicy, OffloadSettings};
pub use proxy::{forwardable_headers, ForwardRequest, RequestProxy};
pub use selector::{endpoint_model_type, extract_model_name, ModelSelector};
