//! `Stream`: the per-broadcast object that tracks what's on disk and serves
//! clip/screenshot requests by filling any gaps from the past-range
//! downloader and then handing the result to the cutter.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base::{err, Error};
use tokio::sync::Mutex;

use crate::cutter::{CutOptions, Cutter, Seek};
use crate::downloader::{BroadcastStatus, PastRangeDownloader};
use crate::ids::StreamKey;
use crate::intervals::find_intersections;

/// One contiguous span already on disk, as an absolute unix-second range.
#[derive(Clone, Debug)]
pub struct Segment {
    pub range: Range<i64>,
    pub path: PathBuf,
}

/// The file a live capture is still writing to.
#[derive(Clone, Debug)]
struct ActiveDownload {
    /// Absolute unix-second timestamp recorded the instant the downloader
    /// confirmed it started writing (not when the subprocess was spawned).
    start: i64,
    path: PathBuf,
}

struct State {
    is_live: bool,
    active_download: Option<ActiveDownload>,
    /// Finished live captures. Checked before any past-range fetch, since
    /// re-fetching something already captured live would be wasteful.
    past_actdl: Vec<Segment>,
    /// On-demand past-range fetches taken while the broadcast was live.
    past_segments_live: Vec<Segment>,
    /// On-demand past-range fetches of an already-finalized VOD.
    past_segments_vod: Vec<Segment>,
}

/// One piece of a clip request resolved to an on-disk file: the portion of
/// the request it covers, and where in the file that portion starts.
struct Piece {
    covered: Range<i64>,
    base: i64,
    path: PathBuf,
}

/// Aggregates everything known about one broadcast: the segments captured
/// live or fetched on demand, and the locks serializing clip extraction
/// and past-range downloads against each other.
pub struct Stream {
    pub key: StreamKey,
    stream_url: String,
    dir: PathBuf,
    state: Mutex<State>,
    /// Serializes clip/screenshot requests against each other so two
    /// overlapping requests don't both try to fill the same gap.
    clip_mutex: Mutex<()>,
    /// Serializes past-range downloads against each other (but not against
    /// clip reads of already-covered segments).
    pastdl_mutex: Mutex<()>,
    past_range: Arc<dyn PastRangeDownloader>,
    cutter: Arc<dyn Cutter>,
}

impl Stream {
    pub fn new(
        key: StreamKey,
        stream_url: String,
        dir: PathBuf,
        past_range: Arc<dyn PastRangeDownloader>,
        cutter: Arc<dyn Cutter>,
    ) -> Self {
        Stream {
            key,
            stream_url,
            dir,
            state: Mutex::new(State {
                is_live: false,
                active_download: None,
                past_actdl: Vec::new(),
                past_segments_live: Vec::new(),
                past_segments_vod: Vec::new(),
            }),
            clip_mutex: Mutex::new(()),
            pastdl_mutex: Mutex::new(()),
            past_range,
            cutter,
        }
    }

    pub async fn set_live(&self, is_live: bool) {
        self.state.lock().await.is_live = is_live;
    }

    pub async fn is_live(&self) -> bool {
        self.state.lock().await.is_live
    }

    /// Records that a live capture has started writing `path`, as of `start`
    /// (absolute unix seconds).
    pub async fn start_active_download(&self, start: i64, path: PathBuf) {
        self.state.lock().await.active_download = Some(ActiveDownload { start, path });
    }

    /// Records that the active capture ended at `end` (absolute unix
    /// seconds, already cushioned by the caller). If `usable` the capture
    /// is appended to `past_actdl`; either way the active-download slot is
    /// cleared.
    pub async fn finish_active_download(&self, end: i64, usable: bool) {
        let mut state = self.state.lock().await;
        if let Some(active) = state.active_download.take() {
            if usable {
                state.past_actdl.push(Segment {
                    range: active.start..end,
                    path: active.path,
                });
            }
        }
    }

    /// Records a segment (typically from a past-range fetch made ahead of
    /// time, or a test fixture) as an already-finalized VOD segment.
    pub async fn add_segment(&self, segment: Segment) {
        self.state.lock().await.past_segments_vod.push(segment);
    }

    /// Every file this stream currently claims, including the active
    /// download. A janitor sweep must never delete any of these out from
    /// under it without going through [`Stream::clean_space`].
    pub async fn used_files(&self) -> Vec<PathBuf> {
        let state = self.state.lock().await;
        let mut paths: Vec<PathBuf> = state
            .past_actdl
            .iter()
            .chain(state.past_segments_live.iter())
            .chain(state.past_segments_vod.iter())
            .map(|s| s.path.clone())
            .collect();
        if let Some(active) = &state.active_download {
            paths.push(active.path.clone());
        }
        paths
    }

    /// The earliest timestamp this stream knows about, for ordering janitor
    /// sweeps across streams (oldest broadcast asked to free space first).
    pub async fn start_time(&self) -> Option<i64> {
        let state = self.state.lock().await;
        state
            .past_actdl
            .iter()
            .chain(state.past_segments_live.iter())
            .chain(state.past_segments_vod.iter())
            .map(|s| s.range.start)
            .chain(state.active_download.as_ref().map(|a| a.start))
            .min()
    }

    /// Deletes this stream's own oldest-by-mtime segments until at least
    /// `bytes_needed` bytes have been freed, or nothing eligible remains.
    /// The active download is never a candidate. Returns the deleted paths.
    pub async fn clean_space(&self, bytes_needed: u64) -> Result<Vec<PathBuf>, Error> {
        let candidates: Vec<PathBuf> = {
            let state = self.state.lock().await;
            state
                .past_actdl
                .iter()
                .chain(state.past_segments_live.iter())
                .chain(state.past_segments_vod.iter())
                .map(|s| s.path.clone())
                .collect()
        };
        let mut with_mtime = Vec::new();
        for path in candidates {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if let Ok(mtime) = meta.modified() {
                    with_mtime.push((mtime, path, meta.len()));
                }
            }
        }
        with_mtime.sort_by_key(|(mtime, _, _)| *mtime);

        let mut freed = 0u64;
        let mut deleted = Vec::new();
        for (_, path, size) in with_mtime {
            if freed >= bytes_needed {
                break;
            }
            if tokio::fs::remove_file(&path).await.is_ok() {
                let mut state = self.state.lock().await;
                state.past_actdl.retain(|s| s.path != path);
                state.past_segments_live.retain(|s| s.path != path);
                state.past_segments_vod.retain(|s| s.path != path);
                drop(state);
                freed += size;
                deleted.push(path);
            }
        }
        Ok(deleted)
    }

    /// Resolves `[lo, hi)` to a set of on-disk pieces, fetching whatever
    /// isn't already covered. Tries, in order: the active download (if its
    /// start already precedes `lo`), a `past_actdl` entry that fully covers
    /// the request, and finally a gap-fill over whatever segments exist,
    /// padding each uncovered gap by 30s on both sides before fetching. A
    /// `past_actdl` file that's vanished out from under us, or a fetch that
    /// reports a live status different from what we believed, restarts the
    /// whole resolution (up to 3 times) rather than failing outright.
    async fn ensure_covered(&self, lo: i64, hi: i64) -> Result<Vec<Piece>, Error> {
        for _attempt in 0..3 {
            let active = self.state.lock().await.active_download.clone();
            if let Some(active) = active {
                if active.start <= lo {
                    return Ok(vec![Piece {
                        covered: lo..hi,
                        base: active.start,
                        path: active.path,
                    }]);
                }
            }

            let candidate = {
                let state = self.state.lock().await;
                state
                    .past_actdl
                    .iter()
                    .find(|s| s.range.start <= lo && s.range.end >= hi)
                    .cloned()
            };
            if let Some(seg) = candidate {
                match tokio::fs::metadata(&seg.path).await {
                    Ok(_) => {
                        return Ok(vec![Piece {
                            covered: lo..hi,
                            base: seg.range.start,
                            path: seg.path,
                        }])
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        let mut state = self.state.lock().await;
                        state.past_actdl.retain(|s| s.path != seg.path);
                        continue;
                    }
                    Err(e) => return Err(Error::from(e)),
                }
            }

            let (is_live, known) = {
                let state = self.state.lock().await;
                let known: Vec<Range<i64>> = state
                    .past_segments_live
                    .iter()
                    .chain(state.past_segments_vod.iter())
                    .chain(state.past_actdl.iter())
                    .map(|s| s.range.clone())
                    .collect();
                (state.is_live, known)
            };
            let (_covered, gaps) = find_intersections(lo..hi, &known);
            if gaps.is_empty() {
                break;
            }

            let _guard = self.pastdl_mutex.lock().await;
            let mut status_mismatch = false;
            for gap in gaps {
                let padded = (gap.start - 30).max(0)..(gap.end + 30);
                let (path, status) = match self
                    .past_range
                    .fetch(&self.key, &self.stream_url, padded.clone(), &self.dir)
                    .await
                {
                    Ok(v) => v,
                    Err(e) if e.kind() == base::ErrorKind::DownloadCacheMissing => continue,
                    Err(e) => return Err(e),
                };
                let reported_live = status == BroadcastStatus::Live;
                if reported_live != is_live {
                    status_mismatch = true;
                    break;
                }
                let segment = Segment {
                    range: padded,
                    path,
                };
                let mut state = self.state.lock().await;
                if reported_live {
                    state.past_segments_live.push(segment);
                } else {
                    state.past_segments_vod.push(segment);
                }
            }
            if status_mismatch {
                continue;
            }
            break;
        }

        let state = self.state.lock().await;
        let known: Vec<Range<i64>> = state
            .past_segments_live
            .iter()
            .chain(state.past_segments_vod.iter())
            .chain(state.past_actdl.iter())
            .map(|s| s.range.clone())
            .collect();
        let (covered, uncovered) = find_intersections(lo..hi, &known);
        if !uncovered.is_empty() {
            return Err(err!(
                OutOfTimeRange,
                "{}..{} not fully covered for {}",
                lo,
                hi,
                self.key
            ));
        }
        let mut pieces = Vec::new();
        for c in covered {
            let seg = state
                .past_segments_live
                .iter()
                .chain(state.past_segments_vod.iter())
                .chain(state.past_actdl.iter())
                .find(|s| s.range.start <= c.start && s.range.end >= c.end)
                .ok_or_else(|| err!(Internal, "covered range {:?} maps to no segment", c))?;
            pieces.push(Piece {
                covered: c,
                base: seg.range.start,
                path: seg.path.clone(),
            });
        }
        Ok(pieces)
    }

    async fn cut_pieces(&self, pieces: &[Piece], opts: CutOptions, dest: &Path) -> Result<(), Error> {
        if pieces.len() == 1 {
            let piece = &pieces[0];
            let seek = Seek::FromStart((piece.covered.start - piece.base) as f64);
            let duration = (piece.covered.end - piece.covered.start) as f64;
            return self.cutter.cut(&piece.path, seek, duration, dest, opts).await;
        }
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir).await.map_err(Error::from)?;
        let mut parts = Vec::with_capacity(pieces.len());
        for (i, piece) in pieces.iter().enumerate() {
            let part = dir.join(format!("part-{i}.ts"));
            let seek = Seek::FromStart((piece.covered.start - piece.base) as f64);
            let duration = (piece.covered.end - piece.covered.start) as f64;
            self.cutter.cut(&piece.path, seek, duration, &part, opts).await?;
            parts.push(part);
        }
        self.cutter.concat(&parts, dest).await
    }

    /// Cuts `[lo, hi)` to `dest`. If `max_bytes` is set and the result comes
    /// out larger, the requested end is pulled in by 1s and the whole cut
    /// is retried (down to a 1s clip), matching an upload-size ceiling a
    /// caller might be serving toward.
    pub async fn clip(
        &self,
        lo: i64,
        mut hi: i64,
        opts: CutOptions,
        max_bytes: Option<u64>,
        dest: &Path,
    ) -> Result<(), Error> {
        let _guard = self.clip_mutex.lock().await;
        loop {
            let pieces = self.ensure_covered(lo, hi).await?;
            self.cut_pieces(&pieces, opts, dest).await?;
            if let Some(max) = max_bytes {
                let size = tokio::fs::metadata(dest).await.map_err(Error::from)?.len();
                if size > max && hi - lo > 1 {
                    let _ = tokio::fs::remove_file(dest).await;
                    hi -= 1;
                    continue;
                }
            }
            return Ok(());
        }
    }

    /// Extracts a single frame at `at` (unix seconds) to `dest`.
    pub async fn screenshot(&self, at: i64, opts: CutOptions, dest: &Path) -> Result<(), Error> {
        let _guard = self.clip_mutex.lock().await;
        let pieces = self.ensure_covered(at, at + 1).await?;
        let piece = pieces
            .first()
            .ok_or_else(|| err!(Internal, "no piece resolved for screenshot at {at}"))?;
        let seek = Seek::FromStart((piece.covered.start - piece.base) as f64);
        self.cutter.screenshot(&piece.path, seek, dest, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cutter::tests::FakeCutter;
    use crate::ids::Platform;
    use async_trait::async_trait;

    struct NeverHasIt;

    #[async_trait]
    impl PastRangeDownloader for NeverHasIt {
        async fn fetch(
            &self,
            _key: &StreamKey,
            _url: &str,
            _range: Range<i64>,
            _dir: &Path,
        ) -> Result<(PathBuf, BroadcastStatus), Error> {
            Err(err!(DownloadCacheMissing, "nothing cached"))
        }
    }

    async fn stream_with_segment() -> (tempfile::TempDir, Stream) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.ts");
        tokio::fs::write(&path, b"0123456789").await.unwrap();
        let stream = Stream::new(
            StreamKey::new(Platform::Y, "s1"),
            "https://y.example/watch/s1".into(),
            dir.path().to_path_buf(),
            Arc::new(NeverHasIt),
            Arc::new(FakeCutter),
        );
        stream
            .add_segment(Segment {
                range: 100..200,
                path,
            })
            .await;
        (dir, stream)
    }

    #[tokio::test]
    async fn clip_within_a_single_covered_segment() {
        let (dir, stream) = stream_with_segment().await;
        let out = dir.path().join("out.ts");
        stream
            .clip(120, 150, CutOptions::default(), None, &out)
            .await
            .unwrap();
        assert!(out.exists());
    }

    #[tokio::test]
    async fn clip_outside_any_segment_is_out_of_range() {
        let (dir, stream) = stream_with_segment().await;
        let out = dir.path().join("out.ts");
        let err = stream
            .clip(500, 600, CutOptions::default(), None, &out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::OutOfTimeRange);
    }

    #[tokio::test]
    async fn active_download_fast_path_wins_over_segments() {
        let (dir, stream) = stream_with_segment().await;
        let active_path = dir.path().join("active.ts");
        tokio::fs::write(&active_path, b"live bytes").await.unwrap();
        stream.start_active_download(50, active_path).await;

        let out = dir.path().join("out.ts");
        stream
            .clip(60, 90, CutOptions::default(), None, &out)
            .await
            .unwrap();
        assert!(out.exists());
    }

    #[tokio::test]
    async fn finished_active_download_is_recorded_only_if_usable() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Stream::new(
            StreamKey::new(Platform::Y, "s1"),
            "https://y.example/watch/s1".into(),
            dir.path().to_path_buf(),
            Arc::new(NeverHasIt),
            Arc::new(FakeCutter),
        );
        let path = dir.path().join("a.ts");
        tokio::fs::write(&path, b"x").await.unwrap();

        stream.start_active_download(0, path.clone()).await;
        stream.finish_active_download(100, false).await;
        assert!(stream.used_files().await.is_empty());

        stream.start_active_download(0, path.clone()).await;
        stream.finish_active_download(100, true).await;
        assert_eq!(stream.used_files().await, vec![path]);
    }

    #[tokio::test]
    async fn clean_space_never_touches_the_active_download() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Stream::new(
            StreamKey::new(Platform::Y, "s1"),
            "https://y.example/watch/s1".into(),
            dir.path().to_path_buf(),
            Arc::new(NeverHasIt),
            Arc::new(FakeCutter),
        );
        let old = dir.path().join("old.ts");
        tokio::fs::write(&old, vec![0u8; 10]).await.unwrap();
        stream
            .add_segment(Segment {
                range: 0..10,
                path: old.clone(),
            })
            .await;
        let active = dir.path().join("active.ts");
        tokio::fs::write(&active, vec![0u8; 10]).await.unwrap();
        stream.start_active_download(100, active.clone()).await;

        let deleted = stream.clean_space(10).await.unwrap();
        assert_eq!(deleted, vec![old]);
        assert!(active.exists());
    }
}
