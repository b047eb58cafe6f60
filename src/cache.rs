use std::sync::Arc;

use lru::LruCache;

use crate::{Map, ObjectStatus, Oid, PObject};

/// Per-connection object cache.
///
/// Holds every live object the connection has handed out, so
/// that an oid always maps to the same `PObject`. The least
/// recently used unchanged objects are turned back into ghosts
/// once more than `target_size` of them hold state, and ghosts
/// that nobody outside the cache references are dropped.
pub(crate) struct ObjectCache {
    objects: Map<Oid, Arc<PObject>>,
    recency: LruCache<Oid, ()>,
    target_size: usize,
}

impl ObjectCache {
    pub fn new(target_size: usize) -> ObjectCache {
        ObjectCache {
            objects: Map::default(),
            recency: LruCache::unbounded(),
            target_size,
        }
    }

    pub fn get(&mut self, oid: Oid) -> Option<Arc<PObject>> {
        let obj = self.objects.get(&oid)?.clone();
        self.recency.promote(&oid);
        Some(obj)
    }

    /// Looks an object up without counting it as a use.
    pub fn peek(&self, oid: Oid) -> Option<&Arc<PObject>> {
        self.objects.get(&oid)
    }

    pub fn insert(&mut self, obj: Arc<PObject>) {
        let oid = obj.oid();
        self.recency.put(oid, ());
        self.objects.insert(oid, obj);
    }

    pub fn touch(&mut self, oid: Oid) {
        self.recency.promote(&oid);
    }

    pub fn remove(&mut self, oid: Oid) -> Option<Arc<PObject>> {
        self.recency.pop(&oid);
        self.objects.remove(&oid)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn non_ghost_count(&self) -> usize {
        self.objects.values().filter(|obj| !obj.is_ghost()).count()
    }

    /// Ghosts least recently used objects until at most the
    /// target number hold state. Returns how many were ghosted.
    pub fn gc(&mut self) -> usize {
        self.shrink_to(self.target_size)
    }

    /// Ghosts every object that can be ghosted.
    pub fn minimize(&mut self) -> usize {
        self.shrink_to(0)
    }

    fn shrink_to(&mut self, target: usize) -> usize {
        let mut non_ghosts = self.non_ghost_count();
        let mut ghosted = 0;

        if non_ghosts > target {
            // least recently used first
            let candidates: Vec<Oid> = self.recency.iter().rev().map(|(oid, _)| *oid).collect();

            for oid in candidates {
                if non_ghosts <= target {
                    break;
                }
                let obj = if let Some(obj) = self.objects.get(&oid) {
                    obj
                } else {
                    continue;
                };
                if obj.status() == ObjectStatus::Saved && obj.try_ghostify() {
                    non_ghosts -= 1;
                    ghosted += 1;
                }
            }
        }

        let unreferenced: Vec<Oid> = self
            .objects
            .iter()
            .filter(|(_, obj)| obj.is_ghost() && Arc::strong_count(obj) == 1)
            .map(|(oid, _)| *oid)
            .collect();

        for oid in &unreferenced {
            self.remove(*oid);
        }

        log::trace!(
            "cache gc ghosted {ghosted} objects and dropped {} ghosts, {} objects remain",
            unreferenced.len(),
            self.objects.len()
        );

        ghosted
    }
}
