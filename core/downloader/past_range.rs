//! Fetches an already-finished portion of a broadcast directly into a file,
//! for ranges that weren't captured live (or weren't captured at all).

use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use base::{err, Error};
use tokio::process::Command;

use crate::ids::StreamKey;

/// Whether the broadcast was still live at the moment a fetch completed.
/// `Stream::ensure_covered` compares this against the live status it
/// already believed and restarts its gap-fill loop on a mismatch, since a
/// live-to-ended transition mid-fetch can shift which segments are even
/// fetchable.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum BroadcastStatus {
    Live,
    Ended,
}

#[async_trait]
pub trait PastRangeDownloader: Send + Sync {
    /// Downloads `range` (unix seconds, absolute) of `stream_url` into a
    /// new file under `dir`, returning its path and the broadcast's status
    /// as observed at the end of the fetch.
    async fn fetch(
        &self,
        key: &StreamKey,
        stream_url: &str,
        range: Range<i64>,
        dir: &Path,
    ) -> Result<(PathBuf, BroadcastStatus), Error>;
}

/// `PlatformY` past-range fetch: the downloader supports `--download-sections`
/// with absolute offsets, so any in-range window can be fetched directly.
pub struct PlatformYPastRange {
    binary: PathBuf,
}

impl PlatformYPastRange {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        PlatformYPastRange {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl PastRangeDownloader for PlatformYPastRange {
    async fn fetch(
        &self,
        key: &StreamKey,
        stream_url: &str,
        range: Range<i64>,
        dir: &Path,
    ) -> Result<(PathBuf, BroadcastStatus), Error> {
        let out = dir.join(format!(
            "{}-{}-{}.ts",
            key.stream_id, range.start, range.end
        ));
        let section = format!("*{}-{}", range.start, range.end);
        let output = Command::new(&self.binary)
            .arg("--download-sections")
            .arg(&section)
            .arg("--print")
            .arg("is_live")
            .arg("-o")
            .arg(&out)
            .arg(stream_url)
            .output()
            .await
            .map_err(|e| err!(Internal, "spawning past-range downloader: {e}"))?;
        if !output.status.success() {
            return Err(err!(DownloadCacheMissing, "past-range fetch failed for {key}"));
        }
        let status = if String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|l| l.trim() == "True")
        {
            BroadcastStatus::Live
        } else {
            BroadcastStatus::Ended
        };
        Ok((out, status))
    }
}

/// `PlatformT` past-range fetch: preserved as documented-broken. The
/// upstream tool refuses partial VOD downloads on this platform, so every
/// call fails with `DownloadCacheMissing` regardless of the requested
/// range; callers fall back to whatever is already on disk.
// TODO: revisit once the downloader tool supports T's HLS manifest slicing.
pub struct PlatformTPastRange;

#[async_trait]
impl PastRangeDownloader for PlatformTPastRange {
    async fn fetch(
        &self,
        key: &StreamKey,
        _stream_url: &str,
        _range: Range<i64>,
        _dir: &Path,
    ) -> Result<(PathBuf, BroadcastStatus), Error> {
        Err(err!(
            DownloadCacheMissing,
            "platform T does not support partial past-range downloads ({key})"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Platform;

    #[tokio::test]
    async fn platform_t_always_reports_cache_missing() {
        let dl = PlatformTPastRange;
        let key = StreamKey::new(Platform::T, "v1");
        let err = dl
            .fetch(&key, "https://t.example/videos/v1", 0..10, Path::new("/tmp"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::DownloadCacheMissing);
    }
}
