//! HTTP edge for Keel: request submission, clarification and confirmation
//! resume, and process status over the kernel façade.

pub mod api_errors;
pub mod api_models;
pub mod demo;
pub mod handlers;

pub use api_errors::ApiError;
pub use handlers::{build_router, AppState};
