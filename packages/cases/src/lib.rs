// ABOUTME: Case model, storage and orchestration engine for the Drydock service
// ABOUTME: Drives submitted repositories from intake through build, run and termination

pub mod case;
pub mod engine;
pub mod fetch;
pub mod storage;

pub use case::{BuildParams, Case, CaseDescriptor, CaseStage, CaseStatus, ErrorCode};
pub use engine::{CaseEngine, EngineConfig, EngineError, ReadinessPolicy};
pub use fetch::{FetchError, RepoFetcher, RepoSnapshot};
pub use storage::{CaseStorage, StorageError};
