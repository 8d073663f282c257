//! In-memory index of every `Stream` the engine currently knows about.

use std::collections::HashMap;
use std::sync::Arc;

use base::Mutex;

use crate::ids::StreamKey;
use crate::stream::Stream;

#[derive(Default)]
struct RegistryState {
    all_streams: HashMap<StreamKey, Arc<Stream>>,
}

/// Analogous to a database handle: a single lock guarding the map of all
/// known streams. Lookups and inserts are synchronous (the map itself is
/// never held across an `.await`); each `Stream` then guards its own
/// longer-lived locks independently.
#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &StreamKey) -> Option<Arc<Stream>> {
        self.state.lock().all_streams.get(key).cloned()
    }

    /// Inserts `stream` if `key` isn't already present, returning whichever
    /// `Arc<Stream>` ends up registered (the new one, or the one a
    /// concurrent caller beat us to inserting).
    pub fn get_or_insert_with(
        &self,
        key: StreamKey,
        make: impl FnOnce() -> Stream,
    ) -> Arc<Stream> {
        let mut state = self.state.lock();
        state
            .all_streams
            .entry(key)
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }

    pub fn remove(&self, key: &StreamKey) -> Option<Arc<Stream>> {
        self.state.lock().all_streams.remove(key)
    }

    /// Every currently-known stream, for sweeps that need to consult each
    /// one (used files, start times) without holding the registry lock
    /// across an `.await`.
    pub fn all(&self) -> Vec<Arc<Stream>> {
        self.state.lock().all_streams.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().all_streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cutter::tests::FakeCutter;
    use crate::downloader::past_range::PlatformTPastRange;
    use crate::ids::Platform;

    #[test]
    fn get_or_insert_returns_the_same_stream_twice() {
        let registry = Registry::new();
        let key = StreamKey::new(Platform::Y, "s1");
        let make = || {
            Stream::new(
                key.clone(),
                "https://y.example/watch/s1".into(),
                std::path::PathBuf::from("/tmp"),
                Arc::new(PlatformTPastRange),
                Arc::new(FakeCutter),
            )
        };
        let a = registry.get_or_insert_with(key.clone(), make);
        let b = registry.get_or_insert_with(key.clone(), make);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }
}
