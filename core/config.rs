//! Typed configuration, loaded from a TOML file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use base::{err, strutil, Error};
use serde::Deserialize;

/// Top-level configuration file shape.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Address the redirector HTTP server binds.
    pub web_bind: SocketAddr,

    /// Directory holding in-progress and completed live/past-range
    /// downloads.
    pub download_dir: PathBuf,

    /// Directory holding cut clips and screenshots.
    pub clip_dir: PathBuf,

    /// Path to the store database file.
    pub store_path: PathBuf,

    /// Path (or bare name, resolved on `PATH`) to the `yt-dlp`-compatible
    /// downloader binary used for both live captures and past-range fetches.
    #[serde(default = "default_downloader_bin")]
    pub downloader_bin: PathBuf,

    /// Path (or bare name) to the ffmpeg-compatible binary used to cut,
    /// concatenate, and screenshot segments.
    #[serde(default = "default_cutter_bin")]
    pub cutter_bin: PathBuf,

    /// Human-readable byte budget for `download_dir`, e.g. `"250G"`.
    #[serde(default = "default_download_budget")]
    download_budget: String,

    /// Human-readable byte budget for `clip_dir`, e.g. `"50G"`.
    #[serde(default = "default_clip_budget")]
    clip_budget: String,

    /// Default watcher poll period, in seconds, before any backoff.
    #[serde(default = "default_poll_secs")]
    pub poll_period_secs: u64,

    /// Per-channel overrides, keyed by `"<platform>:<channel_id>"`.
    #[serde(default)]
    pub channel_overrides: HashMap<String, ChannelOverride>,
}

fn default_downloader_bin() -> PathBuf {
    PathBuf::from("yt-dlp")
}

fn default_cutter_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_download_budget() -> String {
    "250G".to_string()
}

fn default_clip_budget() -> String {
    "50G".to_string()
}

fn default_poll_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct ChannelOverride {
    pub poll_period_secs: Option<u64>,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| err!(NotFound, "reading config {}: {e}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| err!(InvalidArgument, "parsing config: {e}"))
    }

    pub fn download_budget_bytes(&self) -> Result<i64, Error> {
        strutil::decode_size(&self.download_budget)
            .map_err(|_| err!(InvalidArgument, "invalid download_budget {:?}", self.download_budget))
    }

    pub fn clip_budget_bytes(&self) -> Result<i64, Error> {
        strutil::decode_size(&self.clip_budget)
            .map_err(|_| err!(InvalidArgument, "invalid clip_budget {:?}", self.clip_budget))
    }

    pub fn default_poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let c = Config::parse(
            r#"
            web_bind = "127.0.0.1:8080"
            download_dir = "/var/lib/streamclip/dl"
            clip_dir = "/var/lib/streamclip/clips"
            store_path = "/var/lib/streamclip/store.sqlite3"
        "#,
        )
        .unwrap();
        assert_eq!(c.download_budget_bytes().unwrap(), 250i64 << 30);
        assert_eq!(c.clip_budget_bytes().unwrap(), 50i64 << 30);
        assert_eq!(c.poll_period_secs, 60);
    }

    #[test]
    fn rejects_bad_byte_budget() {
        let c = Config::parse(
            r#"
            web_bind = "127.0.0.1:8080"
            download_dir = "/d"
            clip_dir = "/c"
            store_path = "/s"
            download_budget = "lots"
        "#,
        )
        .unwrap();
        assert!(c.download_budget_bytes().is_err());
    }
}
