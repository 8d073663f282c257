//! Polls one channel for a new broadcast and drives it through its
//! lifecycle: `Idle -> Starting -> Live -> Verifying -> Ended`.

use std::sync::Arc;
use std::time::Duration;

use base::backoff::ExpBackoff;
use base::clock::Clocks;
use base::{err, Error};

use crate::extractor::MetadataExtractor;
use crate::ids::{ChannelKey, StreamKey};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WatcherState {
    /// No broadcast in progress; polling at the default period.
    Idle,
    /// A new stream id was just observed; waiting for the platform to
    /// confirm it's actually live (some platforms briefly list a stream as
    /// upcoming before it starts).
    Starting,
    /// Confirmed live; polling at the (shorter) live-poll period to notice
    /// when it ends.
    Live,
    /// The platform stopped reporting the stream as live; waiting out a
    /// grace period in case this is a transient blip before declaring it
    /// `Ended`.
    Verifying,
    /// The stream has ended and been handed off; the watcher returns to
    /// `Idle` on its next poll.
    Ended,
    /// The extractor reported `DownloadForbidden`: upstream has permanently
    /// refused this target. Polling stops for good; there's no backoff that
    /// fixes a policy decision.
    Terminated,
}

/// A single poll's effect on the watcher: what changed, if anything, that
/// the owning [`crate::sharer::WatcherSharer`] needs to notify registrants
/// about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatcherEvent {
    None,
    StreamStarted(StreamKey),
    StreamEnded(StreamKey),
}

/// Drives the polling loop for one channel.
pub struct Watcher {
    pub channel: ChannelKey,
    extractor: Arc<dyn MetadataExtractor>,
    clocks: Arc<dyn Clocks>,
    state: WatcherState,
    current_stream: Option<StreamKey>,
    verify_started_at: Option<i64>,
    poll_backoff: ExpBackoff,
    live_poll_period: Duration,
    verify_grace_period: Duration,
}

impl Watcher {
    pub fn new(
        channel: ChannelKey,
        extractor: Arc<dyn MetadataExtractor>,
        clocks: Arc<dyn Clocks>,
        idle_poll_period: Duration,
        live_poll_period: Duration,
        verify_grace_period: Duration,
    ) -> Self {
        Watcher {
            channel,
            extractor,
            clocks,
            state: WatcherState::Idle,
            current_stream: None,
            verify_started_at: None,
            poll_backoff: ExpBackoff::new(idle_poll_period, idle_poll_period * 16, 2),
            live_poll_period,
            verify_grace_period,
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// The wait before the next poll, given the current state. Idle polling
    /// backs off on repeated failures; live/verifying polling uses a fixed
    /// short period since we need to notice the end promptly.
    pub fn next_wait(&self) -> Duration {
        match self.state {
            WatcherState::Idle | WatcherState::Starting => self.poll_backoff.current_wait(),
            WatcherState::Live | WatcherState::Verifying => self.live_poll_period,
            WatcherState::Ended => Duration::ZERO,
            // Never polled again; the value doesn't matter.
            WatcherState::Terminated => Duration::MAX,
        }
    }

    /// True once the extractor has reported `DownloadForbidden` for this
    /// target. The owning sharer should stop polling and drop the watcher.
    pub fn is_terminated(&self) -> bool {
        self.state == WatcherState::Terminated
    }

    /// Polls the extractor once and advances the state machine, returning
    /// the resulting [`WatcherEvent`] (if any).
    pub async fn poll_once(&mut self, candidate: &StreamKey) -> Result<WatcherEvent, Error> {
        if self.state == WatcherState::Terminated {
            return Err(err!(DownloadForbidden, "watcher for {candidate:?} is terminated"));
        }
        let result = self.extractor.fetch(candidate).await;
        match result {
            Err(e) if e.kind() == base::ErrorKind::DownloadForbidden => {
                // Upstream has permanently refused this target; no backoff
                // fixes a policy decision, so stop polling for good.
                self.state = WatcherState::Terminated;
                Err(e)
            }
            Err(e) if e.kind() == base::ErrorKind::RateLimited => {
                self.poll_backoff.backoff();
                Err(e)
            }
            Err(e) => {
                self.poll_backoff.backoff();
                Err(e)
            }
            Ok(meta) => {
                self.poll_backoff.cooldown();
                let event = self.advance(candidate.clone(), meta.is_live);
                Ok(event)
            }
        }
    }

    fn advance(&mut self, candidate: StreamKey, is_live: bool) -> WatcherEvent {
        match (self.state, is_live) {
            (WatcherState::Idle, true) => {
                self.state = WatcherState::Starting;
                self.current_stream = Some(candidate);
                WatcherEvent::None
            }
            (WatcherState::Starting, true) => {
                self.state = WatcherState::Live;
                WatcherEvent::StreamStarted(self.current_stream.clone().unwrap())
            }
            (WatcherState::Starting, false) => {
                // Never actually went live; back out quietly.
                self.state = WatcherState::Idle;
                self.current_stream = None;
                WatcherEvent::None
            }
            (WatcherState::Live, true) => WatcherEvent::None,
            (WatcherState::Live, false) => {
                self.state = WatcherState::Verifying;
                self.verify_started_at = Some(self.clocks.unix_secs());
                WatcherEvent::None
            }
            (WatcherState::Verifying, true) => {
                // Blip over; back to Live without re-announcing the start.
                self.state = WatcherState::Live;
                self.verify_started_at = None;
                WatcherEvent::None
            }
            (WatcherState::Verifying, false) => {
                let since = self.verify_started_at.unwrap_or(self.clocks.unix_secs());
                if self.clocks.unix_secs() - since >= self.verify_grace_period.as_secs() as i64 {
                    self.state = WatcherState::Ended;
                    let key = self.current_stream.take().unwrap();
                    WatcherEvent::StreamEnded(key)
                } else {
                    WatcherEvent::None
                }
            }
            (WatcherState::Idle, false) | (WatcherState::Ended, _) => WatcherEvent::None,
            (WatcherState::Terminated, _) => WatcherEvent::None,
        }
    }

    /// Returns the watcher to `Idle` after the owner has finished handling
    /// an `Ended` event.
    pub fn reset(&mut self) {
        if self.state == WatcherState::Ended {
            self.state = WatcherState::Idle;
            self.current_stream = None;
        }
    }

    pub fn current_stream(&self) -> Option<&StreamKey> {
        self.current_stream.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::StreamMetadata;
    use crate::ids::Platform;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct Scripted(StdMutex<Vec<bool>>);

    #[async_trait]
    impl MetadataExtractor for Scripted {
        async fn fetch(&self, key: &StreamKey) -> Result<StreamMetadata, Error> {
            let is_live = self.0.lock().unwrap().remove(0);
            Ok(StreamMetadata {
                key: key.clone(),
                title: "t".into(),
                is_live,
                started_at: Some(0),
                ended_at: None,
            })
        }
    }

    fn watcher(script: Vec<bool>) -> (Watcher, StreamKey) {
        let clocks = Arc::new(base::clock::SimulatedClocks::new(1_000));
        let w = Watcher::new(
            ChannelKey::new(Platform::Y, "ch1"),
            Arc::new(Scripted(StdMutex::new(script))),
            clocks,
            Duration::from_secs(60),
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        (w, StreamKey::new(Platform::Y, "s1"))
    }

    #[tokio::test]
    async fn full_lifecycle_starting_to_live_to_verifying_to_ended() {
        let (mut w, key) = watcher(vec![true, true, false, false]);
        assert_eq!(w.poll_once(&key).await.unwrap(), WatcherEvent::None);
        assert_eq!(w.state(), WatcherState::Starting);

        assert_eq!(
            w.poll_once(&key).await.unwrap(),
            WatcherEvent::StreamStarted(key.clone())
        );
        assert_eq!(w.state(), WatcherState::Live);

        assert_eq!(w.poll_once(&key).await.unwrap(), WatcherEvent::None);
        assert_eq!(w.state(), WatcherState::Verifying);

        // Grace period hasn't elapsed yet (simulated clock doesn't move on
        // its own), so it stays Verifying.
        assert_eq!(w.poll_once(&key).await.unwrap(), WatcherEvent::None);
        assert_eq!(w.state(), WatcherState::Verifying);
    }

    #[tokio::test]
    async fn verifying_blip_returns_to_live() {
        let (mut w, key) = watcher(vec![true, true, false, true]);
        w.poll_once(&key).await.unwrap();
        w.poll_once(&key).await.unwrap();
        w.poll_once(&key).await.unwrap();
        assert_eq!(w.state(), WatcherState::Verifying);
        w.poll_once(&key).await.unwrap();
        assert_eq!(w.state(), WatcherState::Live);
    }

    #[tokio::test]
    async fn starting_that_never_goes_live_backs_out_to_idle() {
        let (mut w, key) = watcher(vec![true, false]);
        w.poll_once(&key).await.unwrap();
        assert_eq!(w.state(), WatcherState::Starting);
        w.poll_once(&key).await.unwrap();
        assert_eq!(w.state(), WatcherState::Idle);
        assert!(w.current_stream().is_none());
    }

    struct AlwaysForbidden;

    #[async_trait]
    impl MetadataExtractor for AlwaysForbidden {
        async fn fetch(&self, _key: &StreamKey) -> Result<StreamMetadata, Error> {
            Err(base::err!(DownloadForbidden, "banned"))
        }
    }

    #[tokio::test]
    async fn download_forbidden_terminates_the_watcher_for_good() {
        let clocks = Arc::new(base::clock::SimulatedClocks::new(1_000));
        let mut w = Watcher::new(
            ChannelKey::new(Platform::Y, "ch1"),
            Arc::new(AlwaysForbidden),
            clocks,
            Duration::from_secs(60),
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        let key = StreamKey::new(Platform::Y, "s1");

        let err = w.poll_once(&key).await.unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::DownloadForbidden);
        assert_eq!(w.state(), WatcherState::Terminated);
        assert!(w.is_terminated());

        // Further polls don't even reach the extractor; they just report
        // the same permanent failure.
        let err = w.poll_once(&key).await.unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::DownloadForbidden);
    }
}
