pub mod live;
pub mod past_range;

pub use live::{CaptureOutcome, ExternalLiveDownloader, LiveCapture, LiveDownloader};
pub use past_range::{BroadcastStatus, PastRangeDownloader, PlatformTPastRange, PlatformYPastRange};
