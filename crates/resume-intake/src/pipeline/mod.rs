pub mod context;
pub mod error;
pub mod item;
pub mod progress;

pub use context::{ItemContext, RunScope};
pub use error::PipelineError;
pub use item::{ItemOutcome, ItemPipeline, SideEffect, Transition};
pub use progress::{log_events, BroadcastProgress, ProgressEvent, ProgressReporter};
