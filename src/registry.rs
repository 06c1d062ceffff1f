//! Identity registry: at most one live instance per remote entity.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::error::Result;
use crate::locator::normalize_url;
use crate::lock;
use crate::mirror::{Resource, Settings};

/// Registry namespace. Keys are unique per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Server,
    Job,
    Build,
    Queue,
    QueueItem,
}

type Entry = Weak<dyn Any + Send + Sync>;

/// Store of weak references to live entities keyed by `(kind, canonical URL)`.
///
/// The registry never keeps an entity alive; entries whose instance was
/// dropped are swept on insertion.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<(EntityKind, String), Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live instance for `url`, or builds one with `create`.
    ///
    /// The second element is true if the instance already existed, in which case
    /// `settings` were folded into it with [`Settings::apply_more_specific`].
    /// The lookup and the insertion happen under one lock, so `create` must not
    /// call back into the registry.
    pub fn get_or_create<T, F>(&self, url: &str, settings: &Settings, create: F) -> Result<(Arc<T>, bool)>
    where
        T: Resource,
        F: FnOnce(&Weak<T>) -> T,
    {
        let key = (T::KIND, normalize_url(url));
        let mut entries = lock(&self.entries);

        if let Some(existing) = entries.get(&key).and_then(Weak::upgrade) {
            if let Ok(instance) = existing.downcast::<T>() {
                drop(entries);
                instance.mirror().apply_more_specific(settings)?;
                tracing::trace!(kind = ?T::KIND, url = %key.1, "registry hit");
                return Ok((instance, true));
            }
        }

        let instance = Arc::new_cyclic(create);
        let erased: Arc<dyn Any + Send + Sync> = instance.clone();
        entries.retain(|_, entry| entry.strong_count() > 0);
        tracing::trace!(kind = ?T::KIND, url = %key.1, "registry insert");
        entries.insert(key, Arc::downgrade(&erased));
        Ok((instance, false))
    }

    /// Returns the live instance for `url` without creating one.
    pub fn lookup<T: Resource>(&self, url: &str) -> Option<Arc<T>> {
        let key = (T::KIND, normalize_url(url));
        lock(&self.entries)
            .get(&key)
            .and_then(Weak::upgrade)
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("live", &self.len()).finish()
    }
}
