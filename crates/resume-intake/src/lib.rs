pub mod config;
pub mod coordinator;
pub mod db;
pub mod dedup;
pub mod enrichment;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod provider;
pub mod sanitize;
pub mod search;
pub mod secrets;
pub mod storage;

pub use config::{load_config, Config};
pub use coordinator::{CoordinatorError, EnqueueRequest, RunCoordinator};
pub use db::Database;
pub use enrichment::{EnrichmentQueue, EnrichmentWorker, HttpEnricher};
pub use error::{ConfigError, ExtractError, IntakeError, Result, StorageError};
pub use pipeline::{ItemPipeline, PipelineError};
pub use provider::{EmailProvider, GraphMailProvider};
pub use search::{SearchMode, SearchOrchestrator};
pub use storage::{FileObjectStorage, ObjectStorage};
