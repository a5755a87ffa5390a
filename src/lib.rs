//! worm-binder: downloads the Worm web serial and binds it into EPUB volumes.

pub mod cli;
pub mod config;
pub mod epub;
pub mod model;
pub mod scraper;
pub mod volume;

// Re-exports for CLI and consumers.
pub use epub::{EpubBuilder, EpubError, EpubVersion};
pub use model::{ArcDescriptor, Chapter, ChapterDescriptor, FetchState, StoryArc, Volume};
pub use scraper::fetch::{EngineError, FetchPool, FetchSummary, Reporter, RetryPolicy};
pub use scraper::{HttpClient, HttpClientBuilder, ScraperError, Transport};
pub use volume::{bind_all, bind_volume, plan_volumes, BindOptions, CoverSet, VolumeError};
