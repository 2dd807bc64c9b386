//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::SynthesisConfig;
use crate::retrieval::DEFAULT_SEARCH_LIMIT;

/// Which mail backend to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Gmail,
    Imap,
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" => Ok(Self::Gmail),
            "imap" | "email" => Ok(Self::Imap),
            other => Err(ConfigError::InvalidValue {
                key: "MAIL_ANSWER_SOURCE".into(),
                message: format!("unknown source '{other}' (expected gmail or imap)"),
            }),
        }
    }
}

impl SourceKind {
    /// `MAIL_ANSWER_SOURCE`, defaulting to Gmail.
    pub fn from_env() -> Result<Self, ConfigError> {
        std::env::var("MAIL_ANSWER_SOURCE")
            .unwrap_or_else(|_| "gmail".to_string())
            .parse()
    }
}

/// Per-stage deadlines enforced by the pipeline around each external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDeadlines {
    /// Listing unread messages and fetching one message.
    pub fetch: Duration,
    /// Knowledge-base search. Expiry degrades to empty context.
    pub retrieval: Duration,
    /// Model call.
    pub synthesis: Duration,
    /// Sending the reply.
    pub dispatch: Duration,
    /// Marking the message read.
    pub acknowledge: Duration,
}

impl Default for StageDeadlines {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(30),
            retrieval: Duration::from_secs(20),
            synthesis: Duration::from_secs(120),
            dispatch: Duration::from_secs(30),
            acknowledge: Duration::from_secs(30),
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum number of knowledge-base results folded into the context.
    pub search_limit: usize,
    pub deadlines: StageDeadlines,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            search_limit: DEFAULT_SEARCH_LIMIT,
            deadlines: StageDeadlines::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let d = defaults.deadlines;
        Ok(Self {
            search_limit: env_or("MAIL_ANSWER_SEARCH_LIMIT", defaults.search_limit)?,
            deadlines: StageDeadlines {
                fetch: env_secs_or("MAIL_ANSWER_FETCH_TIMEOUT_SECS", d.fetch)?,
                retrieval: env_secs_or("MAIL_ANSWER_RETRIEVAL_TIMEOUT_SECS", d.retrieval)?,
                synthesis: env_secs_or("MAIL_ANSWER_SYNTHESIS_TIMEOUT_SECS", d.synthesis)?,
                dispatch: env_secs_or("MAIL_ANSWER_DISPATCH_TIMEOUT_SECS", d.dispatch)?,
                acknowledge: env_secs_or("MAIL_ANSWER_ACK_TIMEOUT_SECS", d.acknowledge)?,
            },
        })
    }
}

impl SynthesisConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            temperature: env_or("MAIL_ANSWER_TEMPERATURE", defaults.temperature)?,
            max_tokens: env_or("MAIL_ANSWER_MAX_TOKENS", defaults.max_tokens)?,
        })
    }
}

/// Parse `key` if set, otherwise return `default`. A set but unparseable
/// value is an error rather than silently ignored.
pub fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs_or(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}
