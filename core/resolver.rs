//! Turns user-facing channel/stream references into canonical platform URLs
//! and ids, and maintains a small directory of well-known channels so users
//! can refer to them by name instead of by platform id.

use std::collections::HashMap;

use url::Url;

use crate::ids::{ChannelKey, Platform, StreamKey};

/// Builds the canonical URL for a channel or a stream on one platform.
pub trait UrlResolver: Send + Sync {
    /// The channel's persistent URL (its "room" for a rewindable-live
    /// platform, its channel page for a finalize-only one).
    fn get_channel_url(&self, channel: &ChannelKey) -> Url;

    /// The URL for one specific broadcast.
    fn get_stream_url(&self, stream: &StreamKey) -> Url;
}

pub struct PlatformYResolver;

impl UrlResolver for PlatformYResolver {
    fn get_channel_url(&self, channel: &ChannelKey) -> Url {
        assert_eq!(channel.platform, Platform::Y);
        Url::parse(&format!(
            "https://y.example/channel/{}/live",
            channel.channel_id
        ))
        .expect("channel id produces a valid URL")
    }

    fn get_stream_url(&self, stream: &StreamKey) -> Url {
        assert_eq!(stream.platform, Platform::Y);
        Url::parse(&format!("https://y.example/watch/{}", stream.stream_id))
            .expect("stream id produces a valid URL")
    }
}

pub struct PlatformTResolver;

impl UrlResolver for PlatformTResolver {
    fn get_channel_url(&self, channel: &ChannelKey) -> Url {
        assert_eq!(channel.platform, Platform::T);
        Url::parse(&format!("https://t.example/@{}", channel.channel_id))
            .expect("channel id produces a valid URL")
    }

    fn get_stream_url(&self, stream: &StreamKey) -> Url {
        assert_eq!(stream.platform, Platform::T);
        Url::parse(&format!("https://t.example/videos/{}", stream.stream_id))
            .expect("stream id produces a valid URL")
    }
}

/// A small in-memory directory mapping a human-friendly alias (a VTuber's
/// name, as users type it in chat) to the channel it refers to. Lookups are
/// case-insensitive.
#[derive(Default)]
pub struct ChannelDirectory {
    by_alias: HashMap<String, ChannelKey>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, alias: impl Into<String>, channel: ChannelKey) {
        self.by_alias.insert(alias.into().to_lowercase(), channel);
    }

    pub fn resolve(&self, alias: &str) -> Option<&ChannelKey> {
        self.by_alias.get(&alias.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn y_resolver_builds_watch_url() {
        let r = PlatformYResolver;
        let url = r.get_stream_url(&StreamKey::new(Platform::Y, "abc123"));
        assert_eq!(url.as_str(), "https://y.example/watch/abc123");
    }

    #[test]
    fn directory_lookup_is_case_insensitive() {
        let mut dir = ChannelDirectory::new();
        dir.register("Kiri Nyan", ChannelKey::new(Platform::Y, "UC1"));
        assert_eq!(
            dir.resolve("kiri nyan").unwrap(),
            &ChannelKey::new(Platform::Y, "UC1")
        );
        assert!(dir.resolve("nobody").is_none());
    }
}
