//! Mail sources the pipeline reads from and replies through.

pub mod email;
pub mod gmail;
pub mod gmail_auth;
pub mod gmail_types;
pub mod source;

pub use email::{EmailConfig, ImapSource};
pub use gmail::{GmailConfig, GmailSource};
pub use source::*;
