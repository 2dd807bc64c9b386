//! Mail Answer: answers unread email questions from a knowledge base.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod retrieval;
