//! Shared error type for table-of-contents parsing, chapter sanitizing, and HTTP fetches.

use thiserror::Error;

/// Shared scraper error for structure, parsing, and transport failures.
#[derive(Debug, Error)]
pub enum ScraperError {
    // Table of contents
    #[error("Malformed table of contents at {node}: {reason}")]
    TocParse { node: String, reason: String },

    #[error("Could not parse arc heading: {label:?}")]
    ArcLabel { label: String },

    // Chapter pages
    #[error("Chapter page has no entry title heading")]
    MissingTitle,

    #[error("Chapter page has no entry content container")]
    MissingContent,

    #[error("Invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },

    #[error("Invalid pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    // HTTP and network
    #[error("Invalid URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("Network error: could not reach {url}: {source}")]
    Network { url: String, source: reqwest::Error },

    #[error("HTTP {status} when fetching: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Failed to read response body from {url}: {source}")]
    BodyRead { url: String, source: reqwest::Error },
}

impl ScraperError {
    /// Transport failures are retried; structural failures are fatal for the run.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScraperError::Network { .. }
                | ScraperError::HttpStatus { .. }
                | ScraperError::BodyRead { .. }
        )
    }
}
