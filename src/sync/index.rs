use crate::feed::Item;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Process-wide id → item lookup shared by every category feed.
///
/// Insert/overwrite only; entries live for the process lifetime. Cloning
/// shares the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
    inner: Arc<RwLock<HashMap<String, Item>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Item> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn insert(&self, item: Item) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item.id.clone(), item);
    }

    pub fn insert_all(&self, items: &[Item]) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for item in items {
            map.insert(item.id.clone(), item.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
