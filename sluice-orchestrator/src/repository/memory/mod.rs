//! In-memory collaborators
//!
//! Complete set of collaborator implementations backed by process memory,
//! for embedding the orchestrator and for tests.

pub mod collaborators;
pub mod lock;
pub mod store;

use std::sync::Arc;

pub use collaborators::{
    LogLine, MemoryElementMetadata, MemoryPermissions, MemoryQualityRules, RecordingEventDispatcher,
    RecordingLogPrinter,
};
pub use lock::MemoryLockStore;
pub use store::{MemoryStore, ReviewDecision, StageAction};

use crate::service::build::Collaborators;

/// All in-memory collaborators, kept as concrete types for inspection
#[derive(Clone)]
pub struct MemoryBackend {
    pub store: Arc<MemoryStore>,
    pub permissions: Arc<MemoryPermissions>,
    pub events: Arc<RecordingEventDispatcher>,
    pub logs: Arc<RecordingLogPrinter>,
    pub elements: Arc<MemoryElementMetadata>,
    pub quality: Arc<MemoryQualityRules>,
    pub locks: Arc<MemoryLockStore>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_elements(MemoryElementMetadata::new())
    }

    /// Backend whose marketplace metadata synthesizes post companions
    pub fn with_elements(elements: MemoryElementMetadata) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            permissions: Arc::new(MemoryPermissions::new()),
            events: Arc::new(RecordingEventDispatcher::new()),
            logs: Arc::new(RecordingLogPrinter::new()),
            elements: Arc::new(elements),
            quality: Arc::new(MemoryQualityRules::new()),
            locks: Arc::new(MemoryLockStore::new()),
        }
    }

    /// Collaborator handles for a [`BuildService`](crate::service::build::BuildService)
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            pipelines: self.store.clone(),
            builds: self.store.clone(),
            variables: self.store.clone(),
            stages: self.store.clone(),
            pause_values: self.store.clone(),
            permissions: self.permissions.clone(),
            events: self.events.clone(),
            logs: self.logs.clone(),
            elements: self.elements.clone(),
            quality: self.quality.clone(),
            lock_store: self.locks.clone(),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}
