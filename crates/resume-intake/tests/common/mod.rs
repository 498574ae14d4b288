//! Shared fixtures for resume-intake integration tests.
//!
//! - `TestHarness` wires an in-memory database to fake mailbox, storage,
//!   extractor and enrichment implementations that count their calls
//! - builders for messages, attachments and folders

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::*;
