//! Gmail source: REST v1 over reqwest.
//!
//! Unread = `INBOX` messages matching `is:unread`. Fetch uses `format=full`
//! (read-only), replies are RFC 5322 messages built with lettre and posted
//! base64url-encoded with the original `threadId`, and acknowledgment
//! removes the `UNREAD` label.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use lettre::Message;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::channels::email::with_threading_headers;
use crate::channels::gmail_auth::TokenStore;
use crate::channels::gmail_types::{
    GmailMessage, ListMessagesResponse, MessagePart, ModifyMessageRequest, SendMessageRequest,
    SentMessage,
};
use crate::channels::source::{InboxMessage, MessageSource, ReadState, ReplyDraft};
use crate::error::{ConfigError, SourceError};

pub const DEFAULT_GMAIL_ENDPOINT: &str = "https://gmail.googleapis.com/gmail/v1";

const UNREAD_LABEL: &str = "UNREAD";
const INBOX_LABEL: &str = "INBOX";
const UNREAD_QUERY: &str = "is:unread";

/// Gmail emits base64url with or without padding depending on the part.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

// ── Configuration ───────────────────────────────────────────────────

/// Gmail source configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    /// API base, e.g. `https://gmail.googleapis.com/gmail/v1`.
    pub endpoint: String,
    /// Authorized-user token file, used when no static token is given.
    pub token_file: PathBuf,
    /// Static bearer token (`GMAIL_ACCESS_TOKEN`), takes precedence.
    pub access_token: Option<SecretString>,
    /// From address written into replies.
    pub from_address: String,
    /// How many list pages to follow. Unread messages beyond are left for
    /// the next run.
    pub max_list_pages: u32,
    pub request_timeout: Duration,
}

impl GmailConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let from_address = std::env::var("GMAIL_FROM_ADDRESS").map_err(|_| {
            ConfigError::MissingRequired {
                key: "GMAIL_FROM_ADDRESS".into(),
                hint: "Set it to the mailbox address replies are sent from.".into(),
            }
        })?;

        let max_list_pages = match std::env::var("GMAIL_MAX_LIST_PAGES") {
            Ok(raw) => raw.parse::<u32>().map_err(|e| ConfigError::InvalidValue {
                key: "GMAIL_MAX_LIST_PAGES".into(),
                message: e.to_string(),
            })?,
            Err(_) => 1,
        };

        let request_timeout = std::env::var("GMAIL_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Ok(Self {
            endpoint: std::env::var("GMAIL_API_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_GMAIL_ENDPOINT.to_string()),
            token_file: std::env::var("GMAIL_TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("token.json")),
            access_token: std::env::var("GMAIL_ACCESS_TOKEN").ok().map(SecretString::from),
            from_address,
            max_list_pages,
            request_timeout,
        })
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// Gmail-backed [`MessageSource`].
pub struct GmailSource {
    http: reqwest::Client,
    base_url: reqwest::Url,
    tokens: TokenStore,
    from_address: String,
    max_list_pages: u32,
}

impl GmailSource {
    pub fn new(config: GmailConfig) -> Result<Self, SourceError> {
        let tokens = match &config.access_token {
            Some(token) => TokenStore::from_access_token(token.expose_secret()),
            None => TokenStore::load(&config.token_file)?,
        };
        Self::with_tokens(config, tokens)
    }

    pub fn with_tokens(config: GmailConfig, tokens: TokenStore) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SourceError::Http(e.to_string()))?;
        let base_url = normalize_base_url(&config.endpoint)?;
        Ok(Self {
            http,
            base_url,
            tokens,
            from_address: config.from_address,
            max_list_pages: config.max_list_pages.max(1),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<reqwest::Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| SourceError::Http("Gmail endpoint must be an absolute URL".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        let url = self.url(segments)?;
        self.send_authorized(|token| {
            self.http
                .get(url.clone())
                .query(query)
                .bearer_auth(token.expose_secret())
        })
        .await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, SourceError> {
        let url = self.url(segments)?;
        self.send_authorized(|token| {
            self.http
                .post(url.clone())
                .json(body)
                .bearer_auth(token.expose_secret())
        })
        .await
    }

    /// Send a request; on 401 refresh the token once and resend.
    async fn send_authorized<T, F>(&self, build: F) -> Result<T, SourceError>
    where
        T: DeserializeOwned,
        F: Fn(&SecretString) -> reqwest::RequestBuilder,
    {
        let token = self.tokens.access_token().await?;
        let response = build(&token).send().await.map_err(request_failed)?;

        let response = if response.status() == reqwest::StatusCode::UNAUTHORIZED
            && self.tokens.can_refresh().await
        {
            debug!("Gmail rejected access token, refreshing and retrying");
            let token = self.tokens.refresh().await?;
            build(&token).send().await.map_err(request_failed)?
        } else {
            response
        };

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| SourceError::RequestFailed {
                name: "gmail".into(),
                reason: format!("invalid response body: {e}"),
            });
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(SourceError::AuthFailed {
                    name: "gmail".into(),
                    reason: format!("{status}: {body}"),
                })
            }
            _ => Err(SourceError::RequestFailed {
                name: "gmail".into(),
                reason: format!("Gmail API request failed ({status}): {body}"),
            }),
        }
    }

    /// Render the reply as a base64url RFC 5322 message.
    fn encode_reply(&self, draft: &ReplyDraft) -> Result<String, SourceError> {
        let from: Mailbox = self.from_address.parse().map_err(|e| SourceError::SendFailed {
            name: "gmail".into(),
            reason: format!("Invalid from address: {e}"),
        })?;
        let to: Mailbox = draft.recipient.parse().map_err(|e| SourceError::SendFailed {
            name: "gmail".into(),
            reason: format!("Invalid recipient {:?}: {e}", draft.recipient),
        })?;

        let builder = Message::builder()
            .from(from)
            .to(to)
            .subject(draft.subject.as_str())
            .header(ContentType::TEXT_PLAIN);

        // threadId keeps the reply in the sender's Gmail thread; the headers
        // thread it for the recipient.
        let email = with_threading_headers(builder, &draft.in_reply_to)
            .body(draft.body.clone())
            .map_err(|e| SourceError::SendFailed {
                name: "gmail".into(),
                reason: format!("Failed to build email: {e}"),
            })?;

        Ok(URL_SAFE_NO_PAD.encode(email.formatted()))
    }
}

#[async_trait]
impl MessageSource for GmailSource {
    fn name(&self) -> &str {
        "gmail"
    }

    async fn list_unread(&self) -> Result<Vec<String>, SourceError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..self.max_list_pages {
            let mut query = vec![("labelIds", INBOX_LABEL), ("q", UNREAD_QUERY)];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let page: ListMessagesResponse =
                self.get_json(&["users", "me", "messages"], &query).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        if page_token.is_some() {
            warn!(
                pages = self.max_list_pages,
                listed = ids.len(),
                "More unread messages remain beyond the page limit; they are left for a later run"
            );
        }

        debug!(count = ids.len(), "Listed unread Gmail messages");
        Ok(ids)
    }

    async fn fetch(&self, id: &str) -> Result<InboxMessage, SourceError> {
        let message: GmailMessage = self
            .get_json(&["users", "me", "messages", id], &[("format", "full")])
            .await?;
        Ok(extract_message(message))
    }

    async fn reply(&self, draft: &ReplyDraft) -> Result<(), SourceError> {
        let raw = self.encode_reply(draft)?;
        let request = SendMessageRequest {
            raw,
            thread_id: (!draft.thread_id.is_empty()).then(|| draft.thread_id.clone()),
        };
        let sent: SentMessage = self
            .post_json(&["users", "me", "messages", "send"], &request)
            .await
            .map_err(|e| match e {
                SourceError::RequestFailed { name, reason } => SourceError::SendFailed { name, reason },
                other => other,
            })?;
        info!(
            sent_id = %sent.id,
            thread_id = sent.thread_id.as_deref().unwrap_or(""),
            "Reply sent via Gmail"
        );
        Ok(())
    }

    async fn mark_read(&self, id: &str) -> Result<(), SourceError> {
        let request = ModifyMessageRequest {
            remove_label_ids: vec![UNREAD_LABEL.to_string()],
        };
        let _: GmailMessage = self
            .post_json(&["users", "me", "messages", id, "modify"], &request)
            .await?;
        Ok(())
    }
}

// ── Extraction ──────────────────────────────────────────────────────

/// Convert a `format=full` Gmail message into an [`InboxMessage`].
///
/// Missing Subject/From headers become empty strings; a message without a
/// `text/plain` part gets an empty body.
pub fn extract_message(message: GmailMessage) -> InboxMessage {
    let payload = message.payload.unwrap_or_default();
    let subject = extract_header(&payload, "Subject").unwrap_or_default();
    let sender = extract_header(&payload, "From").unwrap_or_default();
    let rfc_message_id = extract_header(&payload, "Message-ID")
        .map(|v| v.trim().trim_start_matches('<').trim_end_matches('>'))
        .unwrap_or_default();
    let body = find_plain_text(&payload).unwrap_or_default();
    let read_state = if message.label_ids.iter().any(|l| l == UNREAD_LABEL) {
        ReadState::Unread
    } else {
        ReadState::Read
    };

    InboxMessage {
        thread_id: message.thread_id.unwrap_or_else(|| message.id.clone()),
        id: message.id,
        rfc_message_id: rfc_message_id.to_string(),
        subject: subject.to_string(),
        sender: sender.to_string(),
        body,
        read_state,
    }
}

fn extract_header<'a>(payload: &'a MessagePart, name: &str) -> Option<&'a str> {
    payload
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Depth-first search for the first decodable `text/plain` part.
fn find_plain_text(part: &MessagePart) -> Option<String> {
    if part.mime_type.as_deref() == Some("text/plain")
        && let Some(text) = decode_body_data(part)
    {
        return Some(text);
    }
    part.parts.iter().find_map(find_plain_text)
}

fn decode_body_data(part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_ref()?;
    match URL_SAFE_LENIENT.decode(data) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!(error = %e, "Skipping undecodable text/plain part");
            None
        }
    }
}

fn normalize_base_url(endpoint: &str) -> Result<reqwest::Url, SourceError> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(SourceError::Http("Gmail endpoint must not be empty".into()));
    }
    reqwest::Url::parse(trimmed).map_err(|e| SourceError::Http(format!("invalid Gmail endpoint: {e}")))
}

fn request_failed(e: reqwest::Error) -> SourceError {
    SourceError::RequestFailed {
        name: "gmail".into(),
        reason: e.to_string(),
    }
}
