//! Repository Module
//!
//! Collaborator seams of the orchestrator. Storage, permissions, messaging,
//! log printing and marketplace metadata live behind these traits; the
//! orchestrator only ever talks to them through `Arc<dyn Trait>`.

pub mod build;
pub mod element;
pub mod event;
pub mod lock;
pub mod log;
pub mod memory;
pub mod pause;
pub mod permission;
pub mod pipeline;
pub mod quality;
pub mod stage;
pub mod variable;

pub use build::BuildRepository;
pub use element::ElementMetadataService;
pub use event::EventDispatcher;
pub use lock::LockStore;
pub use log::LogPrinter;
pub use pause::PauseValueRepository;
pub use permission::{Permission, PermissionService};
pub use pipeline::PipelineRepository;
pub use quality::QualityRuleService;
pub use stage::StageRepository;
pub use variable::VariableRepository;
