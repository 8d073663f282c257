//! Supervises the long-running subprocess that downloads a stream while it
//! is live, writing one growing file to disk.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use base::clock::Clocks;
use base::{err, Error};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

/// Startup wait before giving up on ever seeing the `Destination:` marker.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);
/// Grace period between SIGTERM and a hard kill.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Starts a live download for a stream, writing to `output_template` (the
/// downloader tool's own templating, e.g. `%(id)s.%(ext)s`) inside `dir`.
#[async_trait]
pub trait LiveDownloader: Send + Sync {
    async fn start(&self, stream_url: &str, dir: &Path) -> Result<LiveCapture, Error>;
}

enum StartupSignal {
    Started,
    Blocked(String),
}

/// A single in-progress (or just-finished) live capture. `output_path` is
/// fixed at construction from the same template the downloader was invoked
/// with; nothing downstream re-derives it from the subprocess's behavior.
pub struct LiveCapture {
    output_path: Arc<Path>,
    child: Mutex<Child>,
    started_monotonic_ms: i64,
    clocks: Arc<dyn Clocks>,
    /// Set by the stderr-scanning task if it ever sees `HTTP Error 429` or
    /// `HTTP Error 403`; checked once the process exits so `wait()` can
    /// report `DownloadBlocked` instead of treating the exit as graceful.
    blocked: Arc<StdMutex<Option<String>>>,
}

/// What happened when a [`LiveCapture`] finished.
pub struct CaptureOutcome {
    /// Wall-clock duration the capture ran, per the monotonic clock.
    pub duration: std::time::Duration,
    /// Whether the subprocess exited on its own with success, as opposed to
    /// being killed or exiting with failure.
    pub graceful: bool,
}

impl CaptureOutcome {
    /// The capture is only worth recording as a usable segment if it ended
    /// gracefully and ran long enough to contain real content. Very short
    /// captures are usually the downloader immediately failing to attach
    /// to a stream that already ended.
    pub fn is_usable_segment(&self) -> bool {
        self.graceful && self.duration >= std::time::Duration::from_secs(20)
    }
}

impl LiveCapture {
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Waits for the subprocess to exit on its own.
    pub async fn wait(&self) -> Result<CaptureOutcome, Error> {
        let status = self
            .child
            .lock()
            .await
            .wait()
            .await
            .map_err(|e| err!(Internal, "waiting for live capture: {e}"))?;
        if let Some(msg) = self.blocked.lock().unwrap().clone() {
            return Err(err!(DownloadBlocked, "upstream refused the download: {msg}"));
        }
        let duration_ms = self.clocks.monotonic_millis() - self.started_monotonic_ms;
        Ok(CaptureOutcome {
            duration: std::time::Duration::from_millis(duration_ms.max(0) as u64),
            graceful: status.success(),
        })
    }

    /// Stops the capture early (channel going dark, shutdown requested).
    /// Sends SIGTERM to the whole process group first (the downloader
    /// wrapper does not reliably kill its own muxer child on termination),
    /// waits up to 5 s, and falls back to SIGKILL of the group plus a hard
    /// kill of the wrapper itself if it hasn't exited by then. The
    /// resulting [`CaptureOutcome::graceful`] will be `false` either way.
    pub async fn stop(&self) -> Result<(), Error> {
        let mut child = self.child.lock().await;
        let pid = child.id().map(|p| p as i32);
        if let Some(pid) = pid {
            let _ = killpg(Pid::from_raw(pid), Signal::SIGTERM);
        }
        match tokio::time::timeout(TERM_GRACE, child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::error!(?pid, "live downloader did not exit within 5s of SIGTERM; killing");
                if let Some(pid) = pid {
                    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
                }
                child
                    .start_kill()
                    .map_err(|e| err!(Internal, "killing live capture: {e}"))
            }
        }
    }
}

/// Shells out to an external downloader tool (the `yt-dlp`-shaped CLI named
/// in the component design) with `--live-from-start` semantics.
pub struct ExternalLiveDownloader {
    binary: PathBuf,
    clocks: Arc<dyn Clocks>,
}

impl ExternalLiveDownloader {
    pub fn new(binary: impl Into<PathBuf>, clocks: Arc<dyn Clocks>) -> Self {
        ExternalLiveDownloader {
            binary: binary.into(),
            clocks,
        }
    }
}

#[async_trait]
impl LiveDownloader for ExternalLiveDownloader {
    async fn start(&self, stream_url: &str, dir: &Path) -> Result<LiveCapture, Error> {
        let output_template = dir.join("%(id)s.%(ext)s");
        let output_path: Arc<Path> = Arc::from(output_template.clone().into_boxed_path());
        // New session/process group so `stop` can signal the wrapper's
        // grandchild muxer too, since the wrapper doesn't reliably forward
        // termination to it.
        let mut child = unsafe {
            Command::new(&self.binary)
                .arg("--live-from-start")
                .arg("-o")
                .arg(&output_template)
                .arg(stream_url)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .pre_exec(|| {
                    nix::unistd::setsid().map_err(std::io::Error::from)?;
                    Ok(())
                })
                .spawn()
                .map_err(|e| err!(Internal, "spawning live downloader: {e}"))?
        };

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let (tx, mut rx) = mpsc::channel::<StartupSignal>(1);
        let blocked: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));

        let tx_out = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains("Destination:") {
                    let _ = tx_out.send(StartupSignal::Started).await;
                }
            }
        });

        let blocked_writer = blocked.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains("HTTP Error 429") || line.contains("HTTP Error 403") {
                    *blocked_writer.lock().unwrap() = Some(line.clone());
                    let _ = tx.send(StartupSignal::Blocked(line)).await;
                }
            }
        });

        let signal = tokio::time::timeout(STARTUP_TIMEOUT, rx.recv())
            .await
            .map_err(|_| err!(Internal, "timed out waiting for live download to start"))?;

        match signal {
            Some(StartupSignal::Started) => {}
            Some(StartupSignal::Blocked(msg)) => {
                let _ = child.start_kill();
                return Err(err!(DownloadBlocked, "upstream refused the download: {msg}"));
            }
            None => return Err(err!(Internal, "live downloader exited before starting")),
        }

        Ok(LiveCapture {
            output_path,
            child: Mutex::new(child),
            started_monotonic_ms: self.clocks.monotonic_millis(),
            clocks: self.clocks.clone(),
            blocked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_capture_is_not_usable() {
        let o = CaptureOutcome {
            duration: std::time::Duration::from_secs(5),
            graceful: true,
        };
        assert!(!o.is_usable_segment());
    }

    #[test]
    fn killed_capture_is_not_usable_even_if_long() {
        let o = CaptureOutcome {
            duration: std::time::Duration::from_secs(60),
            graceful: false,
        };
        assert!(!o.is_usable_segment());
    }

    #[test]
    fn graceful_long_capture_is_usable() {
        let o = CaptureOutcome {
            duration: std::time::Duration::from_secs(21),
            graceful: true,
        };
        assert!(o.is_usable_segment());
    }
}
