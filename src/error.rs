//! Error types for mail-answer.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by a mail source (Gmail, IMAP/SMTP).
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source {name} request failed: {reason}")]
    RequestFailed { name: String, reason: String },

    #[error("Authentication failed for source {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Message {id} not found")]
    NotFound { id: String },

    #[error("Invalid message {id}: {reason}")]
    InvalidMessage { id: String, reason: String },

    #[error("Failed to send reply on source {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Knowledge-base search errors.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Search request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Search backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid search response: {reason}")]
    InvalidResponse { reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Per-message pipeline errors, tagged with the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Listing unread messages failed: {0}")]
    ListUnread(SourceError),

    #[error("Fetching message failed: {0}")]
    Fetch(SourceError),

    #[error("Synthesis failed: {0}")]
    Synthesis(#[from] LlmError),

    #[error("Synthesis returned empty output")]
    EmptySynthesis,

    #[error("Reply dispatch failed: {0}")]
    Dispatch(SourceError),

    #[error("Reply sent but acknowledgment failed: {0}")]
    Acknowledge(SourceError),

    #[error("{stage} timed out after {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },
}

impl PipelineError {
    /// Short stage name for logs.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::ListUnread(_) => "list",
            Self::Fetch(_) => "fetch",
            Self::Synthesis(_) | Self::EmptySynthesis => "synthesis",
            Self::Dispatch(_) => "dispatch",
            Self::Acknowledge(_) => "acknowledge",
            Self::Timeout { stage, .. } => stage,
        }
    }
}
