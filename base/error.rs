//! Crate-wide error type and the classification ([`ErrorKind`]) the rest of
//! the engine uses to decide whether to retry, back off, or give up.

use std::fmt::{self, Write};

/// Error kind.
///
/// The first block is the generic gRPC-style classification for anything
/// that isn't domain-specific. The second block is the taxonomy this
/// engine actually propagates to user-facing code (see the error handling
/// design): these are the only kinds callers ever need to match on.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,

    /// Upstream refused the download outright (`HTTP Error 429`/`403` from
    /// the live downloader). Parent of the two more specific kinds below.
    DownloadBlocked,
    /// Upstream refused: temporary block / rate limit. Watchers back off.
    RateLimited,
    /// Upstream refused permanently (policy). Terminates the watcher.
    DownloadForbidden,
    /// The requested time range isn't in any cache and can't be fetched.
    DownloadCacheMissing,
    /// Range is valid but the platform's VOD boundary precludes it.
    OutOfTimeRange,
    /// The requested stream was never captured in this channel.
    StreamNotLegal,
    /// The "from end" fast path can't cover the window. Internal only —
    /// callers fall back to the absolute-offset path; this never reaches
    /// a user.
    CantSseof,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::FailedPrecondition => "failed precondition",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Internal => "internal",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::DownloadBlocked => "download blocked",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::DownloadForbidden => "download forbidden",
            ErrorKind::DownloadCacheMissing => "requested range is not cached",
            ErrorKind::OutOfTimeRange => "out of time range",
            ErrorKind::StreamNotLegal => "stream not legal in this channel",
            ErrorKind::CantSseof => "can't seek from end",
        };
        f.write_str(s)
    }
}

/// The engine's error type: a classification plus an optional message and
/// source chain. The kind is always available so retry/backoff policy can
/// match on it without downcasting.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Renders the full cause chain, one `caused by:` line per source —
    /// the form logged around a failed long-lived task.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut cause = self
            .source
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error);
        while let Some(c) = cause {
            write!(&mut out, "\ncaused by: {c}").unwrap();
            cause = c.source();
        }
        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.msg {
            None => fmt::Display::fmt(&self.kind, f),
            Some(m) => write!(f, "{}: {}", self.kind, m),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            _ => ErrorKind::Internal,
        };
        Error {
            kind,
            msg: None,
            source: Some(Box::new(e)),
        }
    }
}

/// Extension methods for annotating a foreign `Result` with an [`ErrorKind`].
pub trait ResultExt<T> {
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| {
            let msg = e.to_string();
            Error {
                kind: k,
                msg: Some(msg),
                source: Some(Box::new(e)),
            }
        })
    }
}

/// Builds an [`Error`] of the given [`ErrorKind`].
///
/// ```
/// use base::{err, ErrorKind};
/// let e = err!(NotFound, "stream {} has no capture", 42);
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// ```
#[macro_export]
macro_rules! err {
    ($k:ident, $fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$k, format!($fmt $(, $arg)*))
    };
}

/// Like `err!`, but returns it wrapped in `Err` from the current function.
#[macro_export]
macro_rules! bail {
    ($k:ident, $fmt:expr $(, $arg:expr)* $(,)?) => {
        return Err($crate::err!($k, $fmt $(, $arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = err!(RateLimited, "retry after {}s", 30);
        assert_eq!(e.kind(), ErrorKind::RateLimited);
        assert_eq!(e.to_string(), "rate limited: retry after 30s");
    }

    #[test]
    fn err_kind_wraps_foreign_error() {
        let r: Result<(), _> = "x".parse::<i32>().map(|_| ());
        let e = r.err_kind(ErrorKind::InvalidArgument).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert!(e.chain().contains("invalid digit"));
    }
}
