//! Crawling the serial: table of contents, chapter fetches, and page cleanup.

mod client;
mod error;

pub mod fetch;
pub mod sanitize;
pub mod toc;

pub use client::{default_user_agent, HttpClient, HttpClientBuilder, DEFAULT_TIMEOUT_SECS};
pub use error::ScraperError;

use async_trait::async_trait;
use scraper::Selector;

/// Front page of the serial; its sidebar holds the table of contents.
pub const DEFAULT_TOC_URL: &str = "https://parahumans.wordpress.com";

/// Byte fetcher used by the crawl. [`HttpClient`] is the real one; tests substitute their own.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url`. Non-success responses are errors.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ScraperError>;
}

/// Parse a CSS selector or return an error (avoids panics from Selector::parse).
pub(crate) fn parse_selector(sel: &str) -> Result<Selector, ScraperError> {
    Selector::parse(sel).map_err(|e| ScraperError::Selector {
        selector: sel.to_string(),
        reason: e.to_string(),
    })
}
