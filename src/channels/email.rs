//! IMAP/SMTP source: raw IMAP over rustls for reading, lettre SMTP for
//! replies.
//!
//! Messages are addressed by IMAP UID so ids stay valid across the separate
//! sessions opened for list, fetch, and mark-read. Fetching uses
//! `BODY.PEEK[]` so reading never sets `\Seen`; only [`MessageSource::mark_read`]
//! does.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MessageBuilder};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::channels::source::{InboxMessage, MessageSource, ReadState, ReplyDraft};
use crate::error::{ConfigError, SourceError};

// ── Configuration ───────────────────────────────────────────────────

/// IMAP/SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub io_timeout: Duration,
}

impl EmailConfig {
    /// Build config from environment variables. `EMAIL_IMAP_HOST`,
    /// `EMAIL_USERNAME` and `EMAIL_PASSWORD` are required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST")
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_IMAP_HOST".into()))?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME")
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_USERNAME".into()))?;
        let password = std::env::var("EMAIL_PASSWORD")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_PASSWORD".into()))?;
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        let io_timeout = std::env::var("EMAIL_IO_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Ok(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            io_timeout,
        })
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// IMAP/SMTP-backed [`MessageSource`].
pub struct ImapSource {
    config: EmailConfig,
}

impl ImapSource {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    /// Open an authenticated session with INBOX selected and run `f` on it
    /// on the blocking pool.
    async fn with_session<T, F>(&self, f: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession<TlsStream>) -> Result<T, SourceError> + Send + 'static,
    {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = connect_tls(&config)?;
            session.read_greeting()?;
            session.login(&config.username, config.password.expose_secret())?;
            session.select_inbox()?;
            let result = f(&mut session);
            session.logout();
            result
        })
        .await
        .map_err(|e| SourceError::RequestFailed {
            name: "imap".into(),
            reason: format!("IMAP task panicked: {e}"),
        })?
    }

    fn send_smtp(config: &EmailConfig, draft: &ReplyDraft) -> Result<(), SourceError> {
        let email = build_reply(&config.from_address, draft)?;

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .timeout(Some(config.io_timeout))
            .build();

        transport
            .send(&email)
            .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl MessageSource for ImapSource {
    fn name(&self) -> &str {
        "imap"
    }

    async fn list_unread(&self) -> Result<Vec<String>, SourceError> {
        let uids = self.with_session(|s| s.uid_search_unseen()).await?;
        debug!(count = uids.len(), "Listed unseen IMAP messages");
        Ok(uids)
    }

    async fn fetch(&self, id: &str) -> Result<InboxMessage, SourceError> {
        let uid = id.to_string();
        let fetched = self.with_session(move |s| s.uid_fetch_peek(&uid)).await?;
        let Some(fetched) = fetched else {
            return Err(SourceError::NotFound { id: id.to_string() });
        };
        parse_message(id, &fetched.raw, fetched.seen)
    }

    async fn reply(&self, draft: &ReplyDraft) -> Result<(), SourceError> {
        let config = self.config.clone();
        let draft_owned = draft.clone();
        tokio::task::spawn_blocking(move || Self::send_smtp(&config, &draft_owned))
            .await
            .map_err(|e| send_failed(format!("SMTP task panicked: {e}")))??;
        info!(to = %draft.recipient, "Reply sent via SMTP");
        Ok(())
    }

    async fn mark_read(&self, id: &str) -> Result<(), SourceError> {
        let uid = id.to_string();
        self.with_session(move |s| s.uid_store_seen(&uid)).await
    }
}

// ── Message building / parsing ──────────────────────────────────────

/// Build the SMTP reply, threading it with `In-Reply-To`/`References`
/// when the original carried a Message-ID.
pub fn build_reply(from_address: &str, draft: &ReplyDraft) -> Result<Message, SourceError> {
    let from: Mailbox = from_address
        .parse()
        .map_err(|e| send_failed(format!("Invalid from address: {e}")))?;
    let to: Mailbox = draft
        .recipient
        .parse()
        .map_err(|e| send_failed(format!("Invalid recipient {:?}: {e}", draft.recipient)))?;

    let builder = Message::builder()
        .from(from)
        .to(to)
        .subject(draft.subject.as_str())
        .header(ContentType::TEXT_PLAIN);

    with_threading_headers(builder, &draft.in_reply_to)
        .body(draft.body.clone())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))
}

/// Cite `message_id` in `In-Reply-To` and `References` so the recipient's
/// client files the reply under the original conversation. No-op when the
/// original had no Message-ID.
pub(crate) fn with_threading_headers(builder: MessageBuilder, message_id: &str) -> MessageBuilder {
    if message_id.is_empty() {
        return builder;
    }
    let reference = format!("<{message_id}>");
    builder.in_reply_to(reference.clone()).references(reference)
}

/// Parse a raw RFC 5322 message into an [`InboxMessage`].
pub fn parse_message(id: &str, raw: &[u8], seen: bool) -> Result<InboxMessage, SourceError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| SourceError::InvalidMessage {
            id: id.to_string(),
            reason: "unparseable RFC 5322 message".into(),
        })?;

    let message_id = parsed.message_id().unwrap_or_default().to_string();
    Ok(InboxMessage {
        id: id.to_string(),
        thread_id: message_id.clone(),
        rfc_message_id: message_id,
        subject: parsed.subject().unwrap_or_default().to_string(),
        sender: extract_sender(&parsed),
        body: extract_plain_text(&parsed),
        read_state: if seen { ReadState::Read } else { ReadState::Unread },
    })
}

/// Sender address, empty when the From header is absent.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// First `text/plain` part (parts without a Content-Type default to it).
fn extract_plain_text(parsed: &mail_parser::Message) -> String {
    parsed
        .parts
        .iter()
        .find_map(|part| {
            let is_plain = match MimeHeaders::content_type(part) {
                Some(ct) => {
                    ct.ctype().eq_ignore_ascii_case("text")
                        && ct
                            .subtype()
                            .is_none_or(|sub| sub.eq_ignore_ascii_case("plain"))
                }
                None => true,
            };
            match &part.body {
                PartType::Text(text) if is_plain => Some(text.to_string()),
                _ => None,
            }
        })
        .unwrap_or_default()
}

fn send_failed(reason: String) -> SourceError {
    SourceError::SendFailed {
        name: "smtp".into(),
        reason,
    }
}

fn imap_failed(reason: impl Into<String>) -> SourceError {
    SourceError::RequestFailed {
        name: "imap".into(),
        reason: reason.into(),
    }
}

// ── IMAP session ────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn connect_tls(config: &EmailConfig) -> Result<ImapSession<TlsStream>, SourceError> {
    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
    tcp.set_read_timeout(Some(config.io_timeout))?;
    tcp.set_write_timeout(Some(config.io_timeout))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
        .map_err(|e| imap_failed(format!("invalid IMAP host name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| imap_failed(format!("TLS setup failed: {e}")))?;

    Ok(ImapSession::new(rustls::StreamOwned::new(conn, tcp)))
}

/// Result of a tagged IMAP command.
#[derive(Debug, Default)]
struct ImapResponse {
    /// Untagged and continuation lines, CRLF stripped.
    lines: Vec<String>,
    /// Literal payloads (`{n}` blocks) in the order received.
    literals: Vec<Vec<u8>>,
}

/// A fetched message body plus whether `\Seen` was already set.
#[derive(Debug)]
pub(crate) struct FetchedMessage {
    raw: Vec<u8>,
    seen: bool,
}

/// Minimal line-oriented IMAP4rev1 client over any byte stream.
pub(crate) struct ImapSession<S: Read + Write> {
    stream: S,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            next_tag: 1,
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, SourceError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte)? {
                0 => return Err(imap_failed("IMAP connection closed")),
                _ => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        buf.truncate(buf.len() - 2);
                        return Ok(buf);
                    }
                }
            }
        }
    }

    fn read_greeting(&mut self) -> Result<(), SourceError> {
        let greeting = String::from_utf8_lossy(&self.read_line()?).into_owned();
        if greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(imap_failed(format!("unexpected IMAP greeting: {greeting}")))
        }
    }

    /// Send a tagged command and collect its response up to the tagged
    /// status line. Fails unless the status is `OK`.
    fn command(&mut self, cmd: &str) -> Result<ImapResponse, SourceError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        self.stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.stream.flush()?;

        let mut response = ImapResponse::default();
        loop {
            let line = String::from_utf8_lossy(&self.read_line()?).into_owned();

            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(response);
                }
                let verb = cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
                return Err(imap_failed(format!("{verb} failed: {status}")));
            }

            if let Some(len) = literal_length(&line) {
                let mut literal = vec![0u8; len];
                self.stream.read_exact(&mut literal)?;
                response.literals.push(literal);
            }
            response.lines.push(line);
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), SourceError> {
        self.command(&format!(
            "LOGIN {} {}",
            quote_imap(username),
            quote_imap(password)
        ))
        .map(|_| ())
        .map_err(|e| SourceError::AuthFailed {
            name: "imap".into(),
            reason: e.to_string(),
        })
    }

    fn select_inbox(&mut self) -> Result<(), SourceError> {
        self.command("SELECT \"INBOX\"").map(|_| ())
    }

    fn uid_search_unseen(&mut self) -> Result<Vec<String>, SourceError> {
        let response = self.command("UID SEARCH UNSEEN")?;
        Ok(response
            .lines
            .iter()
            .filter_map(|line| line.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace().map(str::to_string))
            .collect())
    }

    fn uid_fetch_peek(&mut self, uid: &str) -> Result<Option<FetchedMessage>, SourceError> {
        validate_uid(uid)?;
        let response = self.command(&format!("UID FETCH {uid} (FLAGS BODY.PEEK[])"))?;
        // FLAGS may come before or after the BODY[] literal, so look at
        // every line of the response.
        let seen = response.lines.iter().any(|l| flags_include_seen(l));
        Ok(response
            .literals
            .into_iter()
            .next()
            .map(|raw| FetchedMessage { raw, seen }))
    }

    fn uid_store_seen(&mut self, uid: &str) -> Result<(), SourceError> {
        validate_uid(uid)?;
        self.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))
            .map(|_| ())
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Whether a `FLAGS (...)` list on this line contains `\Seen`.
fn flags_include_seen(line: &str) -> bool {
    let Some(start) = line.find("FLAGS (") else {
        return false;
    };
    let list = &line[start + "FLAGS (".len()..];
    let list = list.split(')').next().unwrap_or_default();
    list.split_whitespace()
        .any(|flag| flag.eq_ignore_ascii_case("\\Seen"))
}

/// `{123}` at the end of a line announces a literal of that many bytes.
fn literal_length(line: &str) -> Option<usize> {
    let rest = line.strip_suffix('}')?;
    let open = rest.rfind('{')?;
    rest[open + 1..].trim_end_matches('+').parse().ok()
}

fn quote_imap(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn validate_uid(uid: &str) -> Result<(), SourceError> {
    if !uid.is_empty() && uid.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(SourceError::InvalidMessage {
            id: uid.to_string(),
            reason: "IMAP UID must be numeric".into(),
        })
    }
}
