//! Inbox-to-answer pipeline.
//!
//! For each unread message, strictly in sequence:
//! 1. `MessageSource::fetch()`: read-only fetch and extraction
//! 2. `ContextRetriever::search()`: best-effort knowledge-base context
//! 3. `ResponseSynthesizer::generate()`: one model call on the fixed template
//! 4. `MessageSource::reply()`: in-thread reply to the sender
//! 5. `MessageSource::mark_read()`: only after the reply went out

pub mod controller;
pub mod types;

pub use controller::PipelineController;
pub use types::{MessageOutcome, MessageState, RunReport};
