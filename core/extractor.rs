//! Platform metadata extraction: given a stream id, find out whether it's
//! live, what its title is, and (for a finalized VOD) when it started and
//! ended.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base::backoff::ExpBackoff;
use base::{clock::Clocks, err, Error, ErrorKind};
use tokio::sync::Mutex;

use crate::ids::{Platform, StreamKey};

/// What the extractor learned about a stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamMetadata {
    pub key: StreamKey,
    pub title: String,
    /// `true` while the broadcast is in progress.
    pub is_live: bool,
    /// Unix seconds the broadcast started, when known.
    pub started_at: Option<i64>,
    /// Unix seconds the broadcast ended, when known (only ever set once
    /// `is_live` is false).
    pub ended_at: Option<i64>,
}

/// Looks up a stream's current metadata on its platform.
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn fetch(&self, key: &StreamKey) -> Result<StreamMetadata, Error>;
}

/// `PlatformY`: the rewindable live platform. Stream ids carry a 17-
/// character date suffix (`...-20240102T030405`) that upstream tooling
/// sometimes echoes back in `stream_id` and sometimes strips; this
/// extractor normalizes by stripping it before treating two ids as the
/// same stream.
pub struct PlatformY {
    client: Arc<dyn PlatformYClient>,
}

/// Narrow seam for what this extractor needs from the network, so tests can
/// substitute canned responses instead of a real platform.
#[async_trait]
pub trait PlatformYClient: Send + Sync {
    async fn lookup(&self, stream_id: &str) -> Result<RawY, Error>;
}

#[derive(Clone, Debug)]
pub struct RawY {
    pub title: String,
    pub is_live: bool,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    /// `true` if the platform's "post-live" flag is still set; for up to
    /// four hours after a stream ends, Y's API keeps reporting it as
    /// "post-live" rather than finalized. Treated as still not-yet-final
    /// (but not live) by callers that need the definitive end time.
    pub post_live: bool,
}

fn strip_date_suffix(stream_id: &str) -> &str {
    // `-YYYYMMDDTHHMMSS` is 17 characters.
    if stream_id.len() > 17 {
        let (head, tail) = stream_id.split_at(stream_id.len() - 17);
        if tail.starts_with('-') && tail[1..].bytes().all(|b| b.is_ascii_digit() || b == b'T') {
            return head;
        }
    }
    stream_id
}

impl PlatformY {
    pub fn new(client: Arc<dyn PlatformYClient>) -> Self {
        PlatformY { client }
    }
}

#[async_trait]
impl MetadataExtractor for PlatformY {
    async fn fetch(&self, key: &StreamKey) -> Result<StreamMetadata, Error> {
        assert_eq!(key.platform, Platform::Y);
        let id = strip_date_suffix(&key.stream_id);
        let raw = self.client.lookup(id).await?;
        Ok(StreamMetadata {
            key: key.clone(),
            title: raw.title,
            is_live: raw.is_live,
            started_at: raw.started_at,
            // The post-live window means "ended" isn't authoritative yet;
            // surface it as still live-ish so callers don't finalize early.
            ended_at: if raw.post_live { None } else { raw.ended_at },
        })
    }
}

/// `PlatformT`: the finalize-only platform. A stream's VOD, and thus its
/// accurate start/end timestamps, only exist after the host finishes
/// transcoding — querying mid-broadcast returns `is_live` with no
/// `ended_at`, ever.
pub struct PlatformT {
    client: Arc<dyn PlatformTClient>,
}

#[async_trait]
pub trait PlatformTClient: Send + Sync {
    async fn lookup(&self, stream_id: &str) -> Result<RawT, Error>;
}

#[derive(Clone, Debug)]
pub struct RawT {
    pub title: String,
    pub is_live: bool,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl PlatformT {
    pub fn new(client: Arc<dyn PlatformTClient>) -> Self {
        PlatformT { client }
    }
}

#[async_trait]
impl MetadataExtractor for PlatformT {
    async fn fetch(&self, key: &StreamKey) -> Result<StreamMetadata, Error> {
        assert_eq!(key.platform, Platform::T);
        let raw = self.client.lookup(&key.stream_id).await?;
        Ok(StreamMetadata {
            key: key.clone(),
            title: raw.title,
            is_live: raw.is_live,
            started_at: raw.started_at,
            ended_at: raw.ended_at,
        })
    }
}

/// Wraps a [`MetadataExtractor`] with a shared rate-limit gate: once the
/// upstream platform answers with [`ErrorKind::RateLimited`], further
/// lookups wait out an [`ExpBackoff`] cooldown instead of hammering it
/// again immediately, and repeated rate limits grow the wait.
pub struct RateLimited<E> {
    inner: E,
    clocks: Arc<dyn Clocks>,
    backoff: Mutex<ExpBackoff>,
}

impl<E: MetadataExtractor> RateLimited<E> {
    pub fn new(inner: E, clocks: Arc<dyn Clocks>) -> Self {
        RateLimited {
            inner,
            clocks,
            backoff: Mutex::new(ExpBackoff::new(
                Duration::from_secs(30),
                Duration::from_secs(30 * 60),
                2,
            )),
        }
    }
}

#[async_trait]
impl<E: MetadataExtractor> MetadataExtractor for RateLimited<E> {
    async fn fetch(&self, key: &StreamKey) -> Result<StreamMetadata, Error> {
        match self.inner.fetch(key).await {
            Ok(m) => {
                self.backoff.lock().await.cooldown();
                Ok(m)
            }
            Err(e) if e.kind() == ErrorKind::RateLimited => {
                let wait = self.backoff.lock().await.backoff();
                self.clocks.sleep(wait).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedY(RawY);

    #[async_trait]
    impl PlatformYClient for CannedY {
        async fn lookup(&self, _stream_id: &str) -> Result<RawY, Error> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn strips_17_char_date_suffix() {
        assert_eq!(strip_date_suffix("abcdefghij-20240102T030405"), "abcdefghij");
        assert_eq!(strip_date_suffix("abcdefghij"), "abcdefghij");
    }

    #[tokio::test]
    async fn post_live_window_suppresses_ended_at() {
        let extractor = PlatformY::new(Arc::new(CannedY(RawY {
            title: "stream".into(),
            is_live: false,
            started_at: Some(100),
            ended_at: Some(200),
            post_live: true,
        })));
        let m = extractor
            .fetch(&StreamKey::new(Platform::Y, "abcdefghij-20240102T030405"))
            .await
            .unwrap();
        assert_eq!(m.ended_at, None);
        assert!(!m.is_live);
    }

    #[tokio::test]
    async fn rate_limit_triggers_backoff_sleep() {
        struct AlwaysRateLimited;
        #[async_trait]
        impl MetadataExtractor for AlwaysRateLimited {
            async fn fetch(&self, _key: &StreamKey) -> Result<StreamMetadata, Error> {
                Err(err!(RateLimited, "too many requests"))
            }
        }
        let clocks = Arc::new(base::clock::SimulatedClocks::new(0));
        let gated = RateLimited::new(AlwaysRateLimited, clocks.clone());
        let key = StreamKey::new(Platform::Y, "x");
        gated.fetch(&key).await.unwrap_err();
        assert_eq!(clocks.monotonic_millis(), 30_000);
        gated.fetch(&key).await.unwrap_err();
        assert_eq!(clocks.monotonic_millis(), 90_000);
    }
}
