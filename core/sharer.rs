//! Multiplexes many registrants onto one [`Watcher`] per channel, so two
//! users watching the same channel share a single poller, and persists
//! registrations so they survive a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base::clock::Clocks;
use base::Error;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::extractor::MetadataExtractor;
use crate::ids::{ChannelKey, StreamKey};
use crate::store::{Store, TypedStore};
use crate::watcher::{Watcher, WatcherEvent};

const NAMESPACE: &str = "watcher_registrations";

/// What to do when a registered channel's watcher fires an event. Each
/// registrant attaches one or more hooks when it registers; they're
/// persisted alongside the registration so a restart doesn't lose them.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Hook {
    /// Start tracking the new stream under a caller-chosen label (used to
    /// report progress back to whoever registered).
    TrackStream { label: String },
    /// Notify an external sink (a chat channel, a webhook) by id.
    Notify { sink_id: String },
}

/// Carries out a [`Hook`]'s effect once a stream goes live. Implemented by
/// whoever wires the engine together (the binary), so this crate doesn't
/// need to know what "tracking" or "notifying" actually look like.
#[async_trait]
pub trait HookSink: Send + Sync {
    async fn fire(&self, hook: &Hook, stream: &StreamKey) -> Result<(), Error>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Registration {
    channel: ChannelKey,
    registrant_id: String,
    hooks: Vec<Hook>,
}

struct Entry {
    watcher_task: tokio::task::JoinHandle<()>,
    events: broadcast::Sender<WatcherEvent>,
    /// Ordered so hooks fire in registration order, per registrant.
    registrants: Vec<(String, Vec<Hook>)>,
    active_stream: Option<StreamKey>,
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.watcher_task.abort();
    }
}

/// Fires every hook of every registrant, in registration order, each as an
/// independent awaited call. A failing hook is logged and does not stop the
/// rest from running.
async fn fire_hooks(sink: &dyn HookSink, registrants: &[(String, Vec<Hook>)], stream: &StreamKey) {
    for (registrant_id, hooks) in registrants {
        for hook in hooks {
            if let Err(e) = sink.fire(hook, stream).await {
                tracing::error!(registrant = %registrant_id, error = %e, ?hook, "hook failed");
            }
        }
    }
}

/// Owns the set of running watchers and the registrants subscribed to each.
pub struct WatcherSharer<S> {
    store: Arc<S>,
    extractor: Arc<dyn MetadataExtractor>,
    clocks: Arc<dyn Clocks>,
    sink: Arc<dyn HookSink>,
    entries: Arc<Mutex<HashMap<ChannelKey, Entry>>>,
}

impl<S: Store + 'static> WatcherSharer<S> {
    pub fn new(
        store: Arc<S>,
        extractor: Arc<dyn MetadataExtractor>,
        clocks: Arc<dyn Clocks>,
        sink: Arc<dyn HookSink>,
    ) -> Self {
        WatcherSharer {
            store,
            extractor,
            clocks,
            sink,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Restarts a watcher for every registration persisted from a previous
    /// run. Called once at startup.
    pub async fn restore(&self) -> Result<(), Error> {
        let typed = TypedStore::new(self.store.as_ref());
        let saved: Vec<(String, Registration)> = typed.list(NAMESPACE).await?;
        for (_key, reg) in saved {
            self.start_watcher_if_needed(&reg.channel).await;
            let mut entries = self.entries.lock().await;
            let entry = entries.get_mut(&reg.channel).expect("just started");
            entry
                .registrants
                .push((reg.registrant_id.clone(), reg.hooks.clone()));
        }
        Ok(())
    }

    async fn start_watcher_if_needed(&self, channel: &ChannelKey) {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(channel) {
            return;
        }
        let (tx, _rx) = broadcast::channel(64);
        let mut watcher = Watcher::new(
            channel.clone(),
            self.extractor.clone(),
            self.clocks.clone(),
            Duration::from_secs(60),
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        let clocks = self.clocks.clone();
        let tx2 = tx.clone();
        let sink = self.sink.clone();
        let all_entries = self.entries.clone();
        let channel2 = channel.clone();
        let candidate = crate::ids::StreamKey::new(channel.platform, channel.channel_id.clone());
        let task = tokio::spawn(async move {
            loop {
                let wait = watcher.next_wait();
                clocks.sleep(wait).await;
                match watcher.poll_once(&candidate).await {
                    Ok(WatcherEvent::None) => {}
                    Ok(event @ WatcherEvent::StreamStarted(ref key)) => {
                        let registrants = {
                            let mut entries = all_entries.lock().await;
                            match entries.get_mut(&channel2) {
                                Some(entry) => {
                                    entry.active_stream = Some(key.clone());
                                    entry.registrants.clone()
                                }
                                None => Vec::new(),
                            }
                        };
                        fire_hooks(sink.as_ref(), &registrants, key).await;
                        let _ = tx2.send(event);
                        watcher.reset();
                    }
                    Ok(event @ WatcherEvent::StreamEnded(_)) => {
                        if let Some(entry) = all_entries.lock().await.get_mut(&channel2) {
                            entry.active_stream = None;
                        }
                        let _ = tx2.send(event);
                        watcher.reset();
                    }
                    Err(_) => {
                        if watcher.is_terminated() {
                            tracing::warn!(channel = %channel2, "watcher permanently stopped");
                            break;
                        }
                    }
                }
            }
        });
        entries.insert(
            channel.clone(),
            Entry {
                watcher_task: task,
                events: tx,
                registrants: Vec::new(),
                active_stream: None,
            },
        );
    }

    /// Registers `registrant_id` for `channel`'s events (starting a watcher
    /// if this is the first registrant), persists the registration, and
    /// returns a receiver of future events. If the channel already has an
    /// active stream, this registrant's hooks fire immediately against it
    /// (as an independent spawned task, so a late joiner doesn't miss the
    /// "stream enabled" event just because it wasn't there for the original
    /// live transition).
    pub async fn register(
        &self,
        channel: ChannelKey,
        registrant_id: String,
        hooks: Vec<Hook>,
    ) -> Result<broadcast::Receiver<WatcherEvent>, Error> {
        self.start_watcher_if_needed(&channel).await;
        let (rx, active_stream) = {
            let mut entries = self.entries.lock().await;
            let entry = entries.get_mut(&channel).expect("just started");
            entry.registrants.retain(|(id, _)| id != &registrant_id);
            entry.registrants.push((registrant_id.clone(), hooks.clone()));
            (entry.events.subscribe(), entry.active_stream.clone())
        };
        if let Some(stream) = active_stream {
            let sink = self.sink.clone();
            let registrants = vec![(registrant_id.clone(), hooks.clone())];
            tokio::spawn(async move {
                fire_hooks(sink.as_ref(), &registrants, &stream).await;
            });
        }
        let typed = TypedStore::new(self.store.as_ref());
        typed
            .put(
                NAMESPACE,
                &registration_key(&channel, &registrant_id),
                &Registration {
                    channel,
                    registrant_id,
                    hooks,
                },
            )
            .await?;
        Ok(rx)
    }

    /// Removes `registrant_id` from `channel`. If it was the last
    /// registrant, the watcher is stopped.
    pub async fn unregister(&self, channel: &ChannelKey, registrant_id: &str) -> Result<(), Error> {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(channel) {
                entry.registrants.retain(|(id, _)| id != registrant_id);
                if entry.registrants.is_empty() {
                    entries.remove(channel);
                }
            }
        }
        let typed = TypedStore::new(self.store.as_ref());
        typed
            .delete(NAMESPACE, &registration_key(channel, registrant_id))
            .await
    }

    pub async fn registrant_count(&self, channel: &ChannelKey) -> usize {
        self.entries
            .lock()
            .await
            .get(channel)
            .map(|e| e.registrants.len())
            .unwrap_or(0)
    }
}

fn registration_key(channel: &ChannelKey, registrant_id: &str) -> String {
    format!("{channel}:{registrant_id}")
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::extractor::StreamMetadata;
    use crate::ids::{Platform, StreamKey};
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct AlwaysIdle;
    #[async_trait]
    impl MetadataExtractor for AlwaysIdle {
        async fn fetch(&self, key: &StreamKey) -> Result<StreamMetadata, Error> {
            Ok(StreamMetadata {
                key: key.clone(),
                title: "t".into(),
                is_live: false,
                started_at: None,
                ended_at: None,
            })
        }
    }

    struct AlwaysLive;
    #[async_trait]
    impl MetadataExtractor for AlwaysLive {
        async fn fetch(&self, key: &StreamKey) -> Result<StreamMetadata, Error> {
            Ok(StreamMetadata {
                key: key.clone(),
                title: "t".into(),
                is_live: true,
                started_at: Some(0),
                ended_at: None,
            })
        }
    }

    pub struct NoopSink;
    #[async_trait]
    impl HookSink for NoopSink {
        async fn fire(&self, _hook: &Hook, _stream: &StreamKey) -> Result<(), Error> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingSink(pub StdMutex<Vec<(Hook, StreamKey)>>);
    #[async_trait]
    impl HookSink for RecordingSink {
        async fn fire(&self, hook: &Hook, stream: &StreamKey) -> Result<(), Error> {
            self.0.lock().unwrap().push((hook.clone(), stream.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn second_registrant_shares_the_first_watcher() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clocks = Arc::new(base::clock::SimulatedClocks::new(0));
        let sharer = WatcherSharer::new(store, Arc::new(AlwaysIdle), clocks, Arc::new(NoopSink));
        let channel = ChannelKey::new(Platform::Y, "ch1");
        sharer
            .register(channel.clone(), "user-a".into(), vec![Hook::Notify { sink_id: "a".into() }])
            .await
            .unwrap();
        sharer
            .register(channel.clone(), "user-b".into(), vec![Hook::Notify { sink_id: "b".into() }])
            .await
            .unwrap();
        assert_eq!(sharer.registrant_count(&channel).await, 2);
    }

    #[tokio::test]
    async fn unregistering_the_last_registrant_drops_the_entry() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clocks = Arc::new(base::clock::SimulatedClocks::new(0));
        let sharer = WatcherSharer::new(store, Arc::new(AlwaysIdle), clocks, Arc::new(NoopSink));
        let channel = ChannelKey::new(Platform::Y, "ch1");
        sharer
            .register(channel.clone(), "user-a".into(), vec![])
            .await
            .unwrap();
        sharer.unregister(&channel, "user-a").await.unwrap();
        assert_eq!(sharer.registrant_count(&channel).await, 0);
    }

    #[tokio::test]
    async fn restore_reloads_persisted_registrations() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clocks = Arc::new(base::clock::SimulatedClocks::new(0));
        let channel = ChannelKey::new(Platform::Y, "ch1");
        {
            let sharer = WatcherSharer::new(store.clone(), Arc::new(AlwaysIdle), clocks.clone(), Arc::new(NoopSink));
            sharer
                .register(channel.clone(), "user-a".into(), vec![])
                .await
                .unwrap();
        }
        let sharer2 = WatcherSharer::new(store, Arc::new(AlwaysIdle), clocks, Arc::new(NoopSink));
        sharer2.restore().await.unwrap();
        assert_eq!(sharer2.registrant_count(&channel).await, 1);
    }

    #[tokio::test]
    async fn live_transition_fires_hooks_in_registration_order() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clocks = Arc::new(base::clock::SimulatedClocks::new(0));
        let sink = Arc::new(RecordingSink::default());
        let sharer = WatcherSharer::new(store, Arc::new(AlwaysLive), clocks, sink.clone());
        let channel = ChannelKey::new(Platform::Y, "ch1");
        let mut rx = sharer
            .register(channel.clone(), "user-a".into(), vec![Hook::Notify { sink_id: "a".into() }])
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within timeout")
            .unwrap();
        assert!(matches!(event, WatcherEvent::StreamStarted(_)));

        let fired = sink.0.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, Hook::Notify { sink_id: "a".into() });
    }

    #[tokio::test]
    async fn late_registrant_gets_hooks_replayed_against_the_active_stream() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clocks = Arc::new(base::clock::SimulatedClocks::new(0));
        let sink = Arc::new(RecordingSink::default());
        let sharer = WatcherSharer::new(store, Arc::new(AlwaysLive), clocks, sink.clone());
        let channel = ChannelKey::new(Platform::Y, "ch1");

        let mut rx = sharer
            .register(channel.clone(), "user-a".into(), vec![])
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within timeout")
            .unwrap();

        sink.0.lock().unwrap().clear();
        sharer
            .register(
                channel.clone(),
                "user-b".into(),
                vec![Hook::TrackStream { label: "late".into() }],
            )
            .await
            .unwrap();

        // The replay is spawned independently of register()'s return, so
        // give it a moment to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fired = sink.0.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, Hook::TrackStream { label: "late".into() });
    }
}
