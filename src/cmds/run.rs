use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base::clock::{Clocks, RealClocks};
use base::{err, Error};
use clap::Args as ClapArgs;
use core_engine::config::Config;
use core_engine::cutter::{Cutter, ExternalCutter};
use core_engine::downloader::{
    BroadcastStatus, ExternalLiveDownloader, LiveCapture, LiveDownloader, PastRangeDownloader,
    PlatformTPastRange, PlatformYPastRange,
};
use core_engine::extractor::{
    MetadataExtractor, PlatformT, PlatformTClient, PlatformY, PlatformYClient, RateLimited, RawT,
    RawY, StreamMetadata,
};
use core_engine::ids::{ChannelKey, Platform, StreamKey};
use core_engine::janitor::Janitor;
use core_engine::redirector::Redirector;
use core_engine::registry::Registry;
use core_engine::resolver::{PlatformTResolver, PlatformYResolver, UrlResolver};
use core_engine::share_counter::SharedHandle;
use core_engine::sharer::{Hook, HookSink, WatcherSharer};
use core_engine::store::SqliteStore;
use core_engine::stream::Stream;
use core_engine::watcher::WatcherEvent;
use std::ops::Range;
use std::path::Path;
use tokio::sync::broadcast;
use tracing::info;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Path to the config file.
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
}

/// How often the janitor sweeps both directories.
const JANITOR_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Stands in for the platform-specific HTTP clients this crate deliberately
/// doesn't ship: wiring a real one in is the integration point for a
/// deployment, not something the engine should hardcode.
struct UnimplementedClient;

#[async_trait]
impl PlatformYClient for UnimplementedClient {
    async fn lookup(&self, _stream_id: &str) -> Result<RawY, Error> {
        Err(err!(Unavailable, "no platform Y client configured"))
    }
}

#[async_trait]
impl PlatformTClient for UnimplementedClient {
    async fn lookup(&self, _stream_id: &str) -> Result<RawT, Error> {
        Err(err!(Unavailable, "no platform T client configured"))
    }
}

struct DispatchingExtractor {
    y: RateLimited<PlatformY>,
    t: RateLimited<PlatformT>,
}

#[async_trait]
impl MetadataExtractor for DispatchingExtractor {
    async fn fetch(&self, key: &StreamKey) -> Result<StreamMetadata, Error> {
        match key.platform {
            Platform::Y => self.y.fetch(key).await,
            Platform::T => self.t.fetch(key).await,
        }
    }
}

struct DispatchingResolver {
    y: PlatformYResolver,
    t: PlatformTResolver,
}

impl UrlResolver for DispatchingResolver {
    fn get_channel_url(&self, channel: &ChannelKey) -> url::Url {
        match channel.platform {
            Platform::Y => self.y.get_channel_url(channel),
            Platform::T => self.t.get_channel_url(channel),
        }
    }

    fn get_stream_url(&self, stream: &StreamKey) -> url::Url {
        match stream.platform {
            Platform::Y => self.y.get_stream_url(stream),
            Platform::T => self.t.get_stream_url(stream),
        }
    }
}

struct DispatchingPastRange {
    y: PlatformYPastRange,
    t: PlatformTPastRange,
}

#[async_trait]
impl PastRangeDownloader for DispatchingPastRange {
    async fn fetch(
        &self,
        key: &StreamKey,
        stream_url: &str,
        range: Range<i64>,
        dir: &Path,
    ) -> Result<(PathBuf, BroadcastStatus), Error> {
        match key.platform {
            Platform::Y => self.y.fetch(key, stream_url, range, dir).await,
            Platform::T => self.t.fetch(key, stream_url, range, dir).await,
        }
    }
}

/// The only [`HookSink`] this binary ships: it has no chat bot or webhook
/// dispatcher of its own, so a registered hook just gets logged. A real
/// deployment supplies its own sink the way it supplies its own platform
/// clients.
struct LoggingHookSink;

#[async_trait]
impl HookSink for LoggingHookSink {
    async fn fire(&self, hook: &Hook, stream: &StreamKey) -> Result<(), Error> {
        info!(?hook, %stream, "hook fired");
        Ok(())
    }
}

/// `"y:some-channel"` -> `ChannelKey`, matching [`Config::channel_overrides`]'s
/// key format.
fn parse_channel_key(s: &str) -> Result<ChannelKey, Error> {
    let (platform, id) = s
        .split_once(':')
        .ok_or_else(|| err!(InvalidArgument, "channel key {s:?} missing ':'"))?;
    let platform = match platform {
        "y" => Platform::Y,
        "t" => Platform::T,
        other => return Err(err!(InvalidArgument, "unknown platform {other:?} in {s:?}")),
    };
    if id.is_empty() {
        return Err(err!(InvalidArgument, "channel key {s:?} has an empty id"));
    }
    Ok(ChannelKey::new(platform, id))
}

/// Drives one channel's downloading: on every live transition, registers the
/// new broadcast with the [`Registry`], starts (or joins) its live capture
/// through the share counter, and records the active download on the
/// [`Stream`] until the capture ends.
#[allow(clippy::too_many_arguments)]
async fn run_channel_engine(
    channel: ChannelKey,
    mut events: broadcast::Receiver<WatcherEvent>,
    registry: Arc<Registry>,
    resolver: Arc<dyn UrlResolver>,
    past_range: Arc<dyn PastRangeDownloader>,
    cutter: Arc<dyn Cutter>,
    live_downloader: Arc<dyn LiveDownloader>,
    download_dir: PathBuf,
    clocks: Arc<dyn Clocks>,
    shutdown: base::shutdown::Receiver,
) {
    // Reused across every live cycle this channel goes through: the slot
    // resets to empty once the last handle from the previous cycle drops.
    let live_share: SharedHandle<LiveCapture, Error> = SharedHandle::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.as_future() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(WatcherEvent::StreamStarted(key)) => {
                let stream_url = resolver.get_stream_url(&key).to_string();
                let stream = registry.get_or_insert_with(key.clone(), || {
                    Stream::new(
                        key.clone(),
                        stream_url.clone(),
                        download_dir.clone(),
                        past_range.clone(),
                        cutter.clone(),
                    )
                });
                stream.set_live(true).await;

                let dl = live_downloader.clone();
                let url = stream_url.clone();
                let dir = download_dir.clone();
                let handle = match live_share
                    .acquire(move || async move { dl.start(&url, &dir).await })
                    .await
                {
                    Ok(h) => h,
                    Err(e) => {
                        tracing::error!(error = %e, %key, "failed to start live capture");
                        continue;
                    }
                };
                stream
                    .start_active_download(clocks.unix_secs(), handle.output_path().to_path_buf())
                    .await;

                let stream2 = stream.clone();
                let clocks2 = clocks.clone();
                tokio::spawn(async move {
                    let usable = match handle.wait().await {
                        Ok(outcome) => outcome.is_usable_segment(),
                        Err(e) => {
                            tracing::error!(error = %e, "live capture ended with error");
                            false
                        }
                    };
                    stream2.finish_active_download(clocks2.unix_secs(), usable).await;
                    drop(handle);
                });
            }
            Ok(WatcherEvent::StreamEnded(key)) => {
                if let Some(stream) = registry.get(&key) {
                    stream.set_live(false).await;
                }
            }
            Ok(WatcherEvent::None) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_janitor_loop<S: core_engine::store::Store + 'static>(
    downloads: Arc<Janitor<S>>,
    clips: Arc<Janitor<S>>,
    registry: Arc<Registry>,
    clocks: Arc<dyn Clocks>,
    shutdown: base::shutdown::Receiver,
) {
    loop {
        tokio::select! {
            _ = shutdown.as_future() => return,
            _ = clocks.sleep(JANITOR_PERIOD) => {}
        }
        if let Err(e) = downloads.sweep_consistency().await {
            tracing::error!(error = %e, "download sweep_consistency failed");
        }
        if let Err(e) = downloads.sweep_downloads(&registry).await {
            tracing::error!(error = %e, "sweep_downloads failed");
        }
        if let Err(e) = clips.sweep_consistency().await {
            tracing::error!(error = %e, "clip sweep_consistency failed");
        }
        if let Err(e) = clips.sweep_evict().await {
            tracing::error!(error = %e, "clip sweep_evict failed");
        }
    }
}

pub async fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    std::fs::create_dir_all(&config.download_dir)?;
    std::fs::create_dir_all(&config.clip_dir)?;

    let store = Arc::new(SqliteStore::open(&config.store_path)?);
    let clocks: Arc<dyn Clocks> = Arc::new(RealClocks);

    let extractor: Arc<dyn MetadataExtractor> = Arc::new(DispatchingExtractor {
        y: RateLimited::new(PlatformY::new(Arc::new(UnimplementedClient)), clocks.clone()),
        t: RateLimited::new(PlatformT::new(Arc::new(UnimplementedClient)), clocks.clone()),
    });
    let resolver: Arc<dyn UrlResolver> = Arc::new(DispatchingResolver {
        y: PlatformYResolver,
        t: PlatformTResolver,
    });
    let past_range: Arc<dyn PastRangeDownloader> = Arc::new(DispatchingPastRange {
        y: PlatformYPastRange::new(config.downloader_bin.clone()),
        t: PlatformTPastRange,
    });
    let cutter: Arc<dyn Cutter> = Arc::new(ExternalCutter::check(config.cutter_bin.clone()).await?);
    let live_downloader: Arc<dyn LiveDownloader> = Arc::new(ExternalLiveDownloader::new(
        config.downloader_bin.clone(),
        clocks.clone(),
    ));

    let registry = Arc::new(Registry::new());

    let sharer = Arc::new(WatcherSharer::new(
        store.clone(),
        extractor,
        clocks.clone(),
        Arc::new(LoggingHookSink),
    ));
    sharer.restore().await?;

    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();

    let mut channel_tasks = Vec::new();
    for key in config.channel_overrides.keys() {
        let channel = parse_channel_key(key)?;
        let events = sharer
            .register(channel.clone(), "engine".to_string(), Vec::new())
            .await?;
        channel_tasks.push(tokio::spawn(run_channel_engine(
            channel,
            events,
            registry.clone(),
            resolver.clone(),
            past_range.clone(),
            cutter.clone(),
            live_downloader.clone(),
            config.download_dir.clone(),
            clocks.clone(),
            shutdown_rx.clone(),
        )));
    }

    let download_janitor = Arc::new(Janitor::new(
        config.download_dir.clone(),
        config.download_budget_bytes()?,
        store.clone(),
    ));
    let clip_janitor = Arc::new(Janitor::new(
        config.clip_dir.clone(),
        config.clip_budget_bytes()?,
        store.clone(),
    ));
    let janitor_task = tokio::spawn(run_janitor_loop(
        download_janitor,
        clip_janitor,
        registry.clone(),
        clocks.clone(),
        shutdown_rx.clone(),
    ));

    let redirector = Arc::new(Redirector::new(store, config.clip_dir.clone()));
    let web_bind = config.web_bind;
    let serve_rx = shutdown_rx.clone();
    let serve_task = tokio::spawn(async move {
        if let Err(e) = core_engine::redirector::serve(web_bind, redirector, serve_rx).await {
            tracing::error!(err = %e.chain(), "redirector server exited with error");
        }
    });

    info!(%web_bind, channels = channel_tasks.len(), "running");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| err!(Internal, "waiting for ctrl-c: {e}"))?;
    info!("shutdown requested");
    drop(shutdown_tx);
    let _ = serve_task.await;
    let _ = janitor_task.await;
    for task in channel_tasks {
        let _ = task.await;
    }
    Ok(0)
}
