//! Service Module
//!
//! Orchestration logic: parameter resolution, model rewriting, admission,
//! locking, status projection and the build service tying them together.

pub mod build;
pub mod env;
pub mod interceptor;
pub mod lock;
pub mod parameter;
pub mod rewriter;
pub mod status;

pub use build::{BuildService, Collaborators};
pub use interceptor::{InterceptorChain, PipelineInterceptor};
pub use lock::LockCoordinator;
pub use rewriter::ModelRewriter;
