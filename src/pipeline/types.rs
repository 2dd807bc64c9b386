//! Per-message states and run results.

use std::fmt;

use crate::error::PipelineError;

// ── Message state ───────────────────────────────────────────────────

/// Where a message is in the inbox-to-answer sequence.
///
/// Transitions run strictly forward, one message at a time:
/// `Listed → Fetched → Extracted → ContextRetrieved → Synthesized → Replied
/// → Acknowledged`. Any stage may instead end in a failure, which leaves
/// the message unread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageState {
    Listed,
    Fetched,
    Extracted,
    ContextRetrieved,
    Synthesized,
    Replied,
    Acknowledged,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listed => "listed",
            Self::Fetched => "fetched",
            Self::Extracted => "extracted",
            Self::ContextRetrieved => "context_retrieved",
            Self::Synthesized => "synthesized",
            Self::Replied => "replied",
            Self::Acknowledged => "acknowledged",
        }
    }

    /// The state that follows a successful step from this one.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Listed => Some(Self::Fetched),
            Self::Fetched => Some(Self::Extracted),
            Self::Extracted => Some(Self::ContextRetrieved),
            Self::ContextRetrieved => Some(Self::Synthesized),
            Self::Synthesized => Some(Self::Replied),
            Self::Replied => Some(Self::Acknowledged),
            Self::Acknowledged => None,
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Terminal result of processing one message.
#[derive(Debug)]
pub enum MessageOutcome {
    /// Reply sent and message marked read.
    Acknowledged { message_id: String },
    /// Processing stopped before a reply was sent; the message is still
    /// unread and will be retried next run.
    Failed {
        message_id: String,
        /// Last state reached before the failure.
        reached: MessageState,
        error: PipelineError,
    },
    /// The reply went out but marking the message read failed. The next run
    /// will see it unread and reply a second time.
    RepliedUnacknowledged {
        message_id: String,
        error: PipelineError,
    },
    /// Already read by the time it was fetched; nothing sent.
    Skipped { message_id: String },
}

impl MessageOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Acknowledged { message_id }
            | Self::Failed { message_id, .. }
            | Self::RepliedUnacknowledged { message_id, .. }
            | Self::Skipped { message_id } => message_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Acknowledged { .. } => "acknowledged",
            Self::Failed { .. } => "failed",
            Self::RepliedUnacknowledged { .. } => "replied_unacknowledged",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Everything that happened in one pipeline run, in processing order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<MessageOutcome>,
}

impl RunReport {
    pub fn listed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn acknowledged(&self) -> usize {
        self.count(|o| matches!(o, MessageOutcome::Acknowledged { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, MessageOutcome::Failed { .. }))
    }

    pub fn unacknowledged(&self) -> usize {
        self.count(|o| matches!(o, MessageOutcome::RepliedUnacknowledged { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, MessageOutcome::Skipped { .. }))
    }

    /// True when every listed message was answered and acknowledged (or
    /// skipped).
    pub fn is_clean(&self) -> bool {
        self.failed() == 0 && self.unacknowledged() == 0
    }

    pub fn outcome_for(&self, message_id: &str) -> Option<&MessageOutcome> {
        self.outcomes.iter().find(|o| o.message_id() == message_id)
    }

    fn count(&self, pred: impl Fn(&MessageOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} listed, {} answered, {} failed, {} answered but not marked read, {} skipped",
            self.listed(),
            self.acknowledged(),
            self.failed(),
            self.unacknowledged(),
            self.skipped()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_advance_in_order() {
        let mut state = MessageState::Listed;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            assert!(next > state);
            state = next;
            seen.push(state);
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(state, MessageState::Acknowledged);
    }

    #[test]
    fn report_counts_by_outcome() {
        let report = RunReport {
            outcomes: vec![
                MessageOutcome::Acknowledged {
                    message_id: "a".into(),
                },
                MessageOutcome::Failed {
                    message_id: "b".into(),
                    reached: MessageState::Synthesized,
                    error: PipelineError::EmptySynthesis,
                },
                MessageOutcome::RepliedUnacknowledged {
                    message_id: "c".into(),
                    error: PipelineError::EmptySynthesis,
                },
                MessageOutcome::Skipped {
                    message_id: "d".into(),
                },
            ],
        };
        assert_eq!(report.listed(), 4);
        assert_eq!(report.acknowledged(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.unacknowledged(), 1);
        assert_eq!(report.skipped(), 1);
        assert!(!report.is_clean());
        assert_eq!(report.outcome_for("c").unwrap().label(), "replied_unacknowledged");
        assert!(report.outcome_for("zzz").is_none());
        assert_eq!(
            report.to_string(),
            "4 listed, 1 answered, 1 failed, 1 answered but not marked read, 1 skipped"
        );
    }

    #[test]
    fn empty_report_is_clean() {
        assert!(RunReport::default().is_clean());
    }
}
