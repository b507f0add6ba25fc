use std::{
  collections::HashMap,
  hash::Hash,
  time::{Duration, Instant},
};

use tokio::sync::RwLock;

/// Concurrent map with per-entry expiry.
///
/// Expiry is lazy: entries past their deadline are dropped on read.
/// [TtlCache::sweep] removes everything expired in one pass, for
/// callers that want to bound memory between reads.
pub struct TtlCache<K, V> {
  entries: RwLock<HashMap<K, TtlEntry<V>>>,
  ttl: Duration,
}

struct TtlEntry<V> {
  value: V,
  expires_at: Instant,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
  pub fn new(ttl: Duration) -> TtlCache<K, V> {
    TtlCache {
      entries: RwLock::new(HashMap::new()),
      ttl,
    }
  }

  pub async fn get(&self, key: &K) -> Option<V> {
    {
      let entries = self.entries.read().await;
      match entries.get(key) {
        Some(entry) if entry.expires_at > Instant::now() => {
          return Some(entry.value.clone());
        }
        Some(_) => {}
        None => return None,
      }
    }
    // Entry exists but is expired. Take the write lock to drop it.
    self.entries.write().await.remove(key);
    None
  }

  pub async fn insert(&self, key: K, value: V) {
    self.entries.write().await.insert(
      key,
      TtlEntry {
        value,
        expires_at: Instant::now() + self.ttl,
      },
    );
  }

  pub async fn remove(&self, key: &K) -> Option<V> {
    self
      .entries
      .write()
      .await
      .remove(key)
      .map(|entry| entry.value)
  }

  pub async fn clear(&self) {
    self.entries.write().await.clear();
  }

  /// Drops all expired entries, returning how many were removed.
  pub async fn sweep(&self) -> usize {
    let now = Instant::now();
    let mut entries = self.entries.write().await;
    let before = entries.len();
    entries.retain(|_, entry| entry.expires_at > now);
    before - entries.len()
  }

  pub async fn len(&self) -> usize {
    self.entries.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.entries.read().await.is_empty()
  }
}

/// Concurrent map of cloneable snapshots, no expiry.
/// Readers get point-in-time copies, writers replace whole entries.
#[derive(Debug)]
pub struct CloneCache<K: Eq + Hash, V: Clone>(
  RwLock<HashMap<K, V>>,
);

impl<K: Eq + Hash, V: Clone> Default for CloneCache<K, V> {
  fn default() -> Self {
    Self(RwLock::new(HashMap::new()))
  }
}

impl<K: Eq + Hash + Clone, V: Clone> CloneCache<K, V> {
  pub async fn get(&self, key: &K) -> Option<V> {
    self.0.read().await.get(key).cloned()
  }

  pub async fn insert(&self, key: K, value: V) -> Option<V> {
    self.0.write().await.insert(key, value)
  }

  pub async fn remove(&self, key: &K) -> Option<V> {
    self.0.write().await.remove(key)
  }

  pub async fn entries(&self) -> Vec<(K, V)> {
    let cache = self.0.read().await;
    cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
  }

  pub async fn retain(&self, keep: impl FnMut(&K, &mut V) -> bool) {
    self.0.write().await.retain(keep);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn ttl_cache_expires_on_read() {
    let cache: TtlCache<String, Vec<String>> =
      TtlCache::new(Duration::from_millis(20));
    cache
      .insert("dockerhub:nginx".to_string(), vec!["1.25".into()])
      .await;
    assert!(
      cache.get(&"dockerhub:nginx".to_string()).await.is_some()
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(
      cache.get(&"dockerhub:nginx".to_string()).await.is_none()
    );
    // Lazy expiry removed the entry entirely.
    assert!(cache.is_empty().await);
  }

  #[tokio::test]
  async fn ttl_cache_sweep_counts_removals() {
    let cache: TtlCache<u32, u32> =
      TtlCache::new(Duration::from_millis(10));
    cache.insert(1, 1).await;
    cache.insert(2, 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    cache.insert(3, 3).await;
    assert_eq!(cache.sweep().await, 2);
    assert_eq!(cache.len().await, 1);
  }
}
