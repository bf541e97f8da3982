use lru::LruCache;
use std::cell::{Cell, RefCell};
use std::num::NonZeroUsize;

pub const DEFAULT_MEMO_CAPACITY: usize = 128;

/// Bounded LRU memo for one lookup operation.
///
/// The generation counter lets a lookup that started before a flush drop its result instead of
/// repopulating the cache with an id that may no longer exist.
pub struct Memo<V> {
    cache: RefCell<LruCache<String, V>>,
    generation: Cell<u64>,
}

impl<V: Clone> Memo<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RefCell::new(LruCache::new(capacity)),
            generation: Cell::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.cache.borrow_mut().get(key).cloned()
    }

    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    /// Store `value` unless the memo was flushed since `generation` was read.
    pub fn insert(&self, key: String, value: V, generation: u64) -> bool {
        if generation != self.generation.get() {
            return false;
        }
        self.cache.borrow_mut().put(key, value);
        true
    }

    pub fn flush(&self) {
        self.cache.borrow_mut().clear();
        self.generation.set(self.generation.get() + 1);
    }

    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let memo = Memo::new(2);
        let generation = memo.generation();
        memo.insert("a".into(), 1, generation);
        memo.insert("b".into(), 2, generation);
        assert_eq!(memo.get("a"), Some(1));
        memo.insert("c".into(), 3, generation);
        assert_eq!(memo.get("b"), None);
        assert_eq!(memo.get("a"), Some(1));
        assert_eq!(memo.get("c"), Some(3));
    }

    #[test]
    fn stale_generation_is_rejected_after_flush() {
        let memo = Memo::new(4);
        let before = memo.generation();
        memo.insert("main.c".into(), 10, before);
        memo.flush();
        assert!(memo.is_empty());
        assert!(!memo.insert("main.c".into(), 10, before));
        assert_eq!(memo.get("main.c"), None);
    }
}
