//! Optional config file loading. Search order: ./worm-binder.toml, then
//! $XDG_CONFIG_HOME/worm-binder/config.toml (or ~/.config/worm-binder/config.toml).

use serde::Deserialize;
use std::path::PathBuf;

const LOCAL_CONFIG: &str = "worm-binder.toml";
const APP_DIR: &str = "worm-binder";

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct Config {
    /// Directory the EPUB files are written to. Relative to CWD.
    pub output_dir: Option<PathBuf>,
    /// HTTP User-Agent header.
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Maximum chapter fetches in flight.
    pub concurrency: Option<usize>,
    /// Give up on a chapter after this many attempts. Unset retries forever.
    pub max_attempts: Option<u32>,
    /// Pause before re-issuing a failed fetch, in milliseconds (default 0).
    pub retry_delay_ms: Option<u64>,
    /// Page holding the table of contents.
    pub toc_url: Option<String>,
}

/// Search order: (1) ./worm-binder.toml, (2) <config dir>/worm-binder/config.toml.
/// Missing file returns Ok(None). Invalid TOML or I/O error reading a present file returns Err.
pub fn load_config() -> Result<Option<Config>, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Cannot determine current directory: {}", e))?;
    let mut paths = vec![cwd.join(LOCAL_CONFIG)];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join(APP_DIR).join("config.toml"));
    }
    for path in &paths {
        if path.exists() {
            let s = std::fs::read_to_string(path)
                .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
            let config = parse_config(&s)
                .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
            return Ok(Some(config));
        }
    }
    Ok(None)
}

pub fn parse_config(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}
