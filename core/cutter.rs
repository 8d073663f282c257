//! Wraps the external media-processing tool used to cut, concatenate, and
//! screenshot downloaded segments into a served clip.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base::{err, Error};
use tokio::process::Command;

/// A clip below this size is almost certainly a truncated or empty file
/// rather than real video, regardless of requested duration.
const MIN_CLIP_BYTES: u64 = 20 * 1024;
/// Same idea for a single-frame screenshot.
const MIN_SCREENSHOT_BYTES: u64 = 200;

/// Where to seek from when extracting a clip or screenshot. Exactly one of
/// these applies per call.
#[derive(Clone, Copy, Debug)]
pub enum Seek {
    /// Seek to `t` seconds from the start of the input.
    FromStart(f64),
    /// Seek to `t` seconds before the end of the input (ffmpeg's `-sseof`).
    /// Only valid when the caller already knows the input's true tail;
    /// giving up on this fast path and falling back to [`Seek::FromStart`]
    /// is the caller's job, not this trait's — this type just issues
    /// whichever one it's given.
    FromEnd(f64),
}

/// Options threaded through every cut/screenshot call.
#[derive(Clone, Copy, Debug, Default)]
pub struct CutOptions {
    /// Drop the video stream, keeping only audio.
    pub audio_only: bool,
    /// Seek before opening the input (fast, keyframe-snapped) rather than
    /// after (slow, frame-accurate). Ignored by `screenshot`'s stream-copy
    /// sibling `cut`, which can only ever land on a keyframe anyway.
    pub quick_seek: bool,
}

/// Produces clips and screenshots from one or more segment files already on
/// disk. Implementations shell out to an external tool; this trait exists
/// so tests can substitute a fake that just copies bytes around.
#[async_trait]
pub trait Cutter: Send + Sync {
    /// Cuts `duration` seconds starting at `seek` out of a single segment
    /// file, writing the result to `output`.
    async fn cut(
        &self,
        input: &Path,
        seek: Seek,
        duration: f64,
        output: &Path,
        opts: CutOptions,
    ) -> Result<(), Error>;

    /// Concatenates `inputs` in order into `output`, re-encoding only at
    /// the join points as the underlying tool requires.
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), Error>;

    /// Extracts a single frame at `seek` into `input`, writing a JPEG to
    /// `output`.
    async fn screenshot(
        &self,
        input: &Path,
        seek: Seek,
        output: &Path,
        opts: CutOptions,
    ) -> Result<(), Error>;
}

fn seek_args(seek: Seek) -> (&'static str, String) {
    match seek {
        Seek::FromStart(t) => ("-ss", t.to_string()),
        Seek::FromEnd(t) => ("-sseof", (-t).to_string()),
    }
}

/// Shells out to an ffmpeg-compatible CLI tool. The binary's presence and
/// usability is checked once, at startup, with `--version`; after that this
/// type assumes the binary keeps working and surfaces any failure as an
/// [`Error`].
pub struct ExternalCutter {
    binary: Arc<Path>,
}

impl ExternalCutter {
    /// Checks that `binary` runs and reports a version before accepting it.
    pub async fn check(binary: impl Into<PathBuf>) -> Result<Self, Error> {
        let binary: Arc<Path> = Arc::from(binary.into().into_boxed_path());
        let status = Command::new(&*binary)
            .arg("-version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| err!(Unavailable, "running {}: {e}", binary.display()))?;
        if !status.success() {
            return Err(err!(
                Unavailable,
                "{} -version exited with {status}",
                binary.display()
            ));
        }
        Ok(ExternalCutter { binary })
    }

    /// Runs the tool with `args`. A non-zero exit is tolerated if `output`
    /// exists anyway — some failure modes (a harmless warning treated as
    /// fatal by the exit code) still produce a usable file — and is a hard
    /// error only when there's nothing to show for it.
    async fn run(&self, args: &[&OsStr], output: &Path) -> Result<(), Error> {
        let result = Command::new(&*self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| err!(Internal, "spawning {}: {e}", self.binary.display()))?;
        if !result.status.success() {
            if tokio::fs::try_exists(output).await.unwrap_or(false) {
                tracing::error!(
                    binary = %self.binary.display(),
                    status = %result.status,
                    stderr = %String::from_utf8_lossy(&result.stderr),
                    "cutter exited non-zero but produced an output file; continuing"
                );
            } else {
                return Err(err!(
                    Internal,
                    "{} exited with {}: {}",
                    self.binary.display(),
                    result.status,
                    String::from_utf8_lossy(&result.stderr)
                ));
            }
        }
        Ok(())
    }
}

async fn check_not_corrupt(output: &Path, min_bytes: u64) -> Result<(), Error> {
    let meta = tokio::fs::metadata(output).await.map_err(Error::from)?;
    if meta.len() < min_bytes {
        return Err(err!(
            Internal,
            "{} is {} bytes, below the {} byte corruption threshold",
            output.display(),
            meta.len(),
            min_bytes
        ));
    }
    Ok(())
}

#[async_trait]
impl Cutter for ExternalCutter {
    async fn cut(
        &self,
        input: &Path,
        seek: Seek,
        duration: f64,
        output: &Path,
        opts: CutOptions,
    ) -> Result<(), Error> {
        let (seek_flag, seek_val) = seek_args(seek);
        let duration = duration.to_string();
        let mut args: Vec<&OsStr> = vec!["-y".as_ref()];
        if opts.quick_seek {
            args.extend(["-ss".as_ref(), seek_val.as_ref()]);
            args.extend(["-i".as_ref(), input.as_os_str()]);
        } else {
            args.extend(["-i".as_ref(), input.as_os_str()]);
            args.extend([seek_flag.as_ref(), seek_val.as_ref()]);
        }
        args.extend(["-t".as_ref(), duration.as_ref()]);
        if opts.audio_only {
            args.push("-vn".as_ref());
        }
        args.extend(["-c".as_ref(), "copy".as_ref(), output.as_os_str()]);
        self.run(&args, output).await?;
        check_not_corrupt(output, MIN_CLIP_BYTES).await
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), Error> {
        let list_file = tempfile_list(inputs)?;
        self.run(
            &[
                "-y".as_ref(),
                "-f".as_ref(),
                "concat".as_ref(),
                "-safe".as_ref(),
                "0".as_ref(),
                "-i".as_ref(),
                list_file.path().as_os_str(),
                "-c".as_ref(),
                "copy".as_ref(),
                output.as_os_str(),
            ],
            output,
        )
        .await?;
        check_not_corrupt(output, MIN_CLIP_BYTES).await
    }

    async fn screenshot(
        &self,
        input: &Path,
        seek: Seek,
        output: &Path,
        opts: CutOptions,
    ) -> Result<(), Error> {
        let (seek_flag, seek_val) = seek_args(seek);
        let mut args: Vec<&OsStr> = vec!["-y".as_ref()];
        if opts.quick_seek {
            args.extend([seek_flag.as_ref(), seek_val.as_ref()]);
            args.extend(["-i".as_ref(), input.as_os_str()]);
        } else {
            args.extend(["-i".as_ref(), input.as_os_str()]);
            args.extend([seek_flag.as_ref(), seek_val.as_ref()]);
        }
        args.extend(["-frames:v".as_ref(), "1".as_ref(), output.as_os_str()]);
        self.run(&args, output).await?;
        check_not_corrupt(output, MIN_SCREENSHOT_BYTES).await
    }
}

fn tempfile_list(inputs: &[PathBuf]) -> Result<tempfile::NamedTempFile, Error> {
    use std::io::Write;
    let mut f = tempfile::NamedTempFile::new()
        .map_err(|e| err!(Internal, "creating concat list: {e}"))?;
    for p in inputs {
        writeln!(f, "file '{}'", p.display())
            .map_err(|e| err!(Internal, "writing concat list: {e}"))?;
    }
    Ok(f)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// A fake cutter used by tests elsewhere in the workspace: `cut` and
    /// `screenshot` just copy the input, `concat` concatenates the raw
    /// bytes of each input in order.
    pub struct FakeCutter;

    #[async_trait]
    impl Cutter for FakeCutter {
        async fn cut(
            &self,
            input: &Path,
            _seek: Seek,
            _duration: f64,
            output: &Path,
            _opts: CutOptions,
        ) -> Result<(), Error> {
            tokio::fs::copy(input, output)
                .await
                .map_err(Error::from)?;
            Ok(())
        }

        async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), Error> {
            let mut buf = Vec::new();
            for p in inputs {
                buf.extend(tokio::fs::read(p).await.map_err(Error::from)?);
            }
            tokio::fs::write(output, buf).await.map_err(Error::from)?;
            Ok(())
        }

        async fn screenshot(
            &self,
            input: &Path,
            _seek: Seek,
            output: &Path,
            _opts: CutOptions,
        ) -> Result<(), Error> {
            tokio::fs::copy(input, output)
                .await
                .map_err(Error::from)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn fake_concat_joins_bytes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        tokio::fs::write(&a, b"hello ").await.unwrap();
        tokio::fs::write(&b, b"world").await.unwrap();
        let out = dir.path().join("out");
        FakeCutter.concat(&[a, b], &out).await.unwrap();
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"hello world");
    }
}
