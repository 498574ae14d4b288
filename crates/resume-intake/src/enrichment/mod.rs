//! Enrichment job handoff: the pipeline enqueues durable jobs and an
//! independent worker consumes them with retries and a hard timeout.

pub mod backoff;
pub mod enricher;
pub mod error;
pub mod http;
pub mod queue;
pub mod worker;

pub use enricher::{Enricher, EnrichmentRequest};
pub use error::{EnrichmentError, FailurePhase};
pub use http::HttpEnricher;
pub use queue::EnrichmentQueue;
pub use worker::{AttemptOutcome, EnrichmentWorker};
