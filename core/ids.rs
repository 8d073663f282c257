//! Identifiers shared across the engine.

use std::fmt;

/// The platform a stream is hosted on. Each variant picks a
/// [`crate::extractor::MetadataExtractor`] and [`crate::resolver::UrlResolver`]
/// implementation with that platform's quirks.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, serde::Serialize, serde::Deserialize)]
pub enum Platform {
    /// The rewindable live platform: a channel has one persistent room URL;
    /// past broadcasts stay fetchable by id for a retention window.
    Y,
    /// The finalize-only platform: a broadcast's definitive VOD only exists
    /// once the stream has ended and the host has finished transcoding it.
    T,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Y => "y",
            Platform::T => "t",
        })
    }
}

/// Uniquely identifies one broadcast: a platform plus that platform's id for
/// the individual stream (not the channel).
#[derive(Clone, Eq, PartialEq, Debug, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct StreamKey {
    pub platform: Platform,
    pub stream_id: String,
}

impl StreamKey {
    pub fn new(platform: Platform, stream_id: impl Into<String>) -> Self {
        StreamKey {
            platform,
            stream_id: stream_id.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.stream_id)
    }
}

/// Identifies a channel (a recurring broadcaster), independent of any one
/// stream. Watchers are keyed on this.
#[derive(Clone, Eq, PartialEq, Debug, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct ChannelKey {
    pub platform: Platform,
    pub channel_id: String,
}

impl ChannelKey {
    pub fn new(platform: Platform, channel_id: impl Into<String>) -> Self {
        ChannelKey {
            platform,
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_platform_prefix() {
        let k = StreamKey::new(Platform::Y, "abc123");
        assert_eq!(k.to_string(), "y:abc123");
    }
}
