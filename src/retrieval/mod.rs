//! Knowledge-base retrieval: turns an email body into a context string.

pub mod confluence;

pub use confluence::{ConfluenceConfig, ConfluenceRetriever};

use async_trait::async_trait;

use crate::error::RetrievalError;

/// Number of search results folded into the context.
pub const DEFAULT_SEARCH_LIMIT: usize = 5;

/// Separator appended after every included fragment.
pub const FRAGMENT_SEPARATOR: &str = "\n\n";

/// One search result. Results without a content body carry `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchHit {
    pub title: Option<String>,
    pub body: Option<String>,
}

impl SearchHit {
    pub fn with_body(body: impl Into<String>) -> Self {
        Self {
            title: None,
            body: Some(body.into()),
        }
    }

    pub fn without_body() -> Self {
        Self::default()
    }
}

/// A searchable knowledge base.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// Search for `query`, returning at most `limit` hits in rank order.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, RetrievalError>;
}

/// Concatenate hit bodies in order, each followed by a blank line.
/// Hits without a body contribute nothing.
pub fn build_context(hits: &[SearchHit]) -> String {
    hits.iter()
        .filter_map(|hit| hit.body.as_deref())
        .fold(String::new(), |mut context, body| {
            context.push_str(body);
            context.push_str(FRAGMENT_SEPARATOR);
            context
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hits_give_empty_context() {
        assert_eq!(build_context(&[]), "");
    }

    #[test]
    fn bodiless_hits_are_skipped_and_order_kept() {
        let hits = vec![
            SearchHit::with_body("first"),
            SearchHit::without_body(),
            SearchHit::with_body("second"),
            SearchHit::without_body(),
            SearchHit::with_body("third"),
        ];
        assert_eq!(build_context(&hits), "first\n\nsecond\n\nthird\n\n");
    }

    #[test]
    fn only_bodiless_hits_give_empty_context() {
        let hits = vec![SearchHit::without_body(), SearchHit::without_body()];
        assert_eq!(build_context(&hits), "");
    }

    #[test]
    fn single_hit_is_followed_by_separator() {
        let hits = vec![SearchHit::with_body("Reset via settings page.")];
        assert_eq!(build_context(&hits), "Reset via settings page.\n\n");
    }

    #[test]
    fn empty_body_still_adds_separator() {
        let hits = vec![SearchHit::with_body("")];
        assert_eq!(build_context(&hits), "\n\n");
    }
}
