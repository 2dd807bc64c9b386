//! Message source abstraction: where unread questions come from and where
//! replies go back to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Read state of a message in the mail system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadState {
    Unread,
    Read,
}

/// A message fetched from the mail system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxMessage {
    /// Source-native message id (Gmail id, IMAP UID).
    pub id: String,
    /// Conversation identifier the reply must be attached to.
    pub thread_id: String,
    /// RFC 5322 `Message-ID` without angle brackets, empty when absent.
    /// Replies cite it in `In-Reply-To`/`References`.
    pub rfc_message_id: String,
    /// Subject header, empty when absent.
    pub subject: String,
    /// From header, empty when absent.
    pub sender: String,
    /// First `text/plain` part, empty when the message has none.
    pub body: String,
    pub read_state: ReadState,
}

impl InboxMessage {
    pub fn new(id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            rfc_message_id: String::new(),
            subject: String::new(),
            sender: String::new(),
            body: String::new(),
            read_state: ReadState::Unread,
        }
    }

    pub fn with_rfc_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.rfc_message_id = message_id.into();
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_unread(&self) -> bool {
        self.read_state == ReadState::Unread
    }
}

/// An outgoing reply. Built, sent, and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDraft {
    pub thread_id: String,
    /// `Message-ID` of the message being answered, empty when unknown.
    pub in_reply_to: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl ReplyDraft {
    /// Build the reply to `message`: same thread, back to the sender,
    /// subject prefixed with `Re: `.
    pub fn to_message(message: &InboxMessage, body: impl Into<String>) -> Self {
        Self {
            thread_id: message.thread_id.clone(),
            in_reply_to: message.rfc_message_id.clone(),
            recipient: message.sender.clone(),
            subject: reply_subject(&message.subject),
            body: body.into(),
        }
    }
}

/// `"Re: "` + the original subject, verbatim.
pub fn reply_subject(subject: &str) -> String {
    format!("Re: {subject}")
}

/// A mail system the pipeline reads questions from and answers into.
///
/// Authentication and session lifecycle belong to the implementation.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Ids of all messages currently flagged unread.
    async fn list_unread(&self) -> Result<Vec<String>, SourceError>;

    /// Fetch a message without changing its read state.
    async fn fetch(&self, id: &str) -> Result<InboxMessage, SourceError>;

    /// Send a reply. A single attempt; no resubmission on failure.
    async fn reply(&self, draft: &ReplyDraft) -> Result<(), SourceError>;

    /// Flag a message as read so later runs skip it.
    async fn mark_read(&self, id: &str) -> Result<(), SourceError>;
}
