//! Memoised channel sets.
//!
//! Computing the channels of a scope can hit the database, so results are
//! cached per scope. The cache is an ordinary value owned by whoever needs it;
//! whoever changes the data a channel source reads must call
//! [`ChannelCache::invalidate`] or [`ChannelCache::invalidate_all`].

use crate::{channel::channels_for_scope, error::Result, DirectiveRegistry};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ChannelCache {
    entries: DashMap<String, Arc<Vec<String>>>,
    /// Bumped on every invalidation so a computation that started before it
    /// does not repopulate the cache with stale data.
    generation: AtomicU64,
}

impl ChannelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached channel set for `scope_id`, computing it on a miss.
    pub async fn channels(
        &self,
        registry: &DirectiveRegistry,
        scope_id: &str,
    ) -> Result<Arc<Vec<String>>> {
        if let Some(hit) = self.entries.get(scope_id) {
            return Ok(Arc::clone(hit.value()));
        }

        let generation = self.generation.load(Ordering::Acquire);
        let computed = Arc::new(channels_for_scope(registry, scope_id).await?);
        if self.generation.load(Ordering::Acquire) == generation {
            self.entries
                .insert(scope_id.to_string(), Arc::clone(&computed));
        }
        Ok(computed)
    }

    pub fn invalidate(&self, scope_id: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.remove(scope_id);
    }

    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelSource, ModelSchema, ModelSyncDirective, SyncDirection};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        calls: AtomicUsize,
    }

    impl ChannelSource for CountingSource {
        fn channels<'a>(&'a self, scope_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![format!("facility/{scope_id}/lab-request")])
            }
            .boxed()
        }
    }

    fn registry(source: Arc<CountingSource>) -> DirectiveRegistry {
        let directive = ModelSyncDirective::new(
            "LabRequest",
            "lab_requests",
            SyncDirection::Bidirectional,
            ModelSchema::default(),
        )
        .with_channel_source(source);
        DirectiveRegistry::new(vec![directive]).unwrap()
    }

    #[test]
    fn hits_do_not_recompute() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let registry = registry(Arc::clone(&source));
        let cache = ChannelCache::new();

        futures::executor::block_on(async {
            let first = cache.channels(&registry, "f1").await.unwrap();
            let second = cache.channels(&registry, "f1").await.unwrap();
            assert_eq!(first, second);
            assert_eq!(*first, vec!["facility/f1/lab-request".to_string()]);
        });
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidation_forces_recompute() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let registry = registry(Arc::clone(&source));
        let cache = ChannelCache::new();

        futures::executor::block_on(async {
            cache.channels(&registry, "f1").await.unwrap();
            cache.channels(&registry, "f2").await.unwrap();
            cache.invalidate("f1");
            assert_eq!(cache.len(), 1);
            cache.channels(&registry, "f1").await.unwrap();
            cache.invalidate_all();
            assert!(cache.is_empty());
        });
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
