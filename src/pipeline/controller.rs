//! Pipeline controller: per unread message, fetch → extract → retrieve →
//! synthesize → reply → acknowledge.
//!
//! **Core invariant: a message is marked read only after its reply was
//! dispatched.** A failure at any earlier stage leaves it unread so the
//! next run picks it up again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::channels::{InboxMessage, MessageSource, ReplyDraft};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::llm::{ResponseSynthesizer, SynthesisRequest};
use crate::pipeline::types::{MessageOutcome, MessageState, RunReport};
use crate::retrieval::{ContextRetriever, build_context};

/// Runs the inbox-to-answer sequence against injected collaborators.
pub struct PipelineController {
    source: Arc<dyn MessageSource>,
    retriever: Arc<dyn ContextRetriever>,
    synthesizer: Arc<dyn ResponseSynthesizer>,
    config: PipelineConfig,
}

impl PipelineController {
    pub fn new(
        source: Arc<dyn MessageSource>,
        retriever: Arc<dyn ContextRetriever>,
        synthesizer: Arc<dyn ResponseSynthesizer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            retriever,
            synthesizer,
            config,
        }
    }

    /// One pass over the unread list, captured once at the start.
    ///
    /// Only a listing failure aborts the run. Every listed message gets
    /// exactly one outcome in the report, in listing order.
    pub async fn run_once(&self) -> Result<RunReport, PipelineError> {
        let ids = with_deadline("list", self.config.deadlines.fetch, async {
            self.source.list_unread().await.map_err(PipelineError::ListUnread)
        })
        .await
        .inspect_err(|e| error!(source = self.source.name(), error = %e, "Listing unread messages failed"))?;

        if ids.is_empty() {
            info!(source = self.source.name(), "No unread messages");
            return Ok(RunReport::default());
        }

        info!(source = self.source.name(), count = ids.len(), "Processing unread messages");

        let mut report = RunReport {
            outcomes: Vec::with_capacity(ids.len()),
        };
        for id in ids {
            let outcome = self.process_message(&id).await;
            debug!(message_id = %id, outcome = outcome.label(), "Message finished");
            report.outcomes.push(outcome);
        }

        info!(
            listed = report.listed(),
            answered = report.acknowledged(),
            failed = report.failed(),
            unacknowledged = report.unacknowledged(),
            "Run complete"
        );
        Ok(report)
    }

    /// Drive one message to a terminal outcome. Never panics on collaborator
    /// failures; they become `Failed` or `RepliedUnacknowledged`.
    pub async fn process_message(&self, id: &str) -> MessageOutcome {
        let deadlines = &self.config.deadlines;
        let mut state = MessageState::Listed;

        let fail = |reached: MessageState, error: PipelineError| {
            warn!(
                message_id = %id,
                stage = error.stage(),
                reached = %reached,
                error = %error,
                "Message left unread"
            );
            MessageOutcome::Failed {
                message_id: id.to_string(),
                reached,
                error,
            }
        };

        // Fetch
        let message = match with_deadline("fetch", deadlines.fetch, async {
            self.source.fetch(id).await.map_err(PipelineError::Fetch)
        })
        .await
        {
            Ok(message) => message,
            Err(e) => return fail(state, e),
        };
        state = advance(id, state);

        if !message.is_unread() {
            info!(message_id = %id, "Message already read, skipping");
            return MessageOutcome::Skipped {
                message_id: id.to_string(),
            };
        }

        // Extract
        let InboxMessage {
            subject,
            sender,
            body: question,
            ..
        } = &message;
        if question.is_empty() {
            debug!(message_id = %id, "No plain-text body, continuing with empty question");
        }
        state = advance(id, state);
        info!(message_id = %id, sender = %sender, subject = %subject, "Answering message");

        // Retrieve
        let context = self.retrieve_context(id, question).await;
        state = advance(id, state);

        // Synthesize
        let prompt = SynthesisRequest::new(question.as_str(), context).render_prompt();
        let answer = match with_deadline("synthesis", deadlines.synthesis, async {
            let text = self.synthesizer.generate(&prompt).await?;
            let text = text.trim();
            if text.is_empty() {
                return Err(PipelineError::EmptySynthesis);
            }
            Ok::<_, PipelineError>(text.to_string())
        })
        .await
        {
            Ok(answer) => answer,
            Err(e) => return fail(state, e),
        };
        state = advance(id, state);

        // Reply
        let draft = ReplyDraft::to_message(&message, answer);
        if let Err(e) = with_deadline("dispatch", deadlines.dispatch, async {
            self.source.reply(&draft).await.map_err(PipelineError::Dispatch)
        })
        .await
        {
            return fail(state, e);
        }
        state = advance(id, state);
        info!(message_id = %id, thread_id = %draft.thread_id, "Reply sent");

        // Acknowledge
        match with_deadline("acknowledge", deadlines.acknowledge, async {
            self.source.mark_read(id).await.map_err(PipelineError::Acknowledge)
        })
        .await
        {
            Ok(()) => {
                advance(id, state);
                info!(message_id = %id, "Message marked read");
                MessageOutcome::Acknowledged {
                    message_id: id.to_string(),
                }
            }
            Err(e) => {
                error!(
                    message_id = %id,
                    stage = e.stage(),
                    reached = %state,
                    error = %e,
                    "Reply sent but message not marked read; the next run will reply again"
                );
                MessageOutcome::RepliedUnacknowledged {
                    message_id: id.to_string(),
                    error: e,
                }
            }
        }
    }

    /// Best-effort context lookup. Errors and timeouts degrade to `""`.
    async fn retrieve_context(&self, id: &str, question: &str) -> String {
        let search = self.retriever.search(question, self.config.search_limit);
        match tokio::time::timeout(self.config.deadlines.retrieval, search).await {
            Ok(Ok(mut hits)) => {
                hits.truncate(self.config.search_limit);
                let context = build_context(&hits);
                debug!(
                    message_id = %id,
                    hits = hits.len(),
                    chars = context.len(),
                    "Context retrieved"
                );
                context
            }
            Ok(Err(e)) => {
                warn!(message_id = %id, stage = "retrieval", error = %e, "Search failed, using empty context");
                String::new()
            }
            Err(_) => {
                warn!(
                    message_id = %id,
                    stage = "retrieval",
                    timeout = ?self.config.deadlines.retrieval,
                    "Search timed out, using empty context"
                );
                String::new()
            }
        }
    }
}

/// Step a message one state forward and log the transition.
fn advance(id: &str, state: MessageState) -> MessageState {
    let next = state.next().unwrap_or(state);
    debug!(message_id = %id, from = %state, to = %next, "Message state advanced");
    next
}

/// Bound `fut` by `timeout`, mapping expiry to [`PipelineError::Timeout`].
async fn with_deadline<T, F>(
    stage: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| PipelineError::Timeout { stage, timeout })?
}
