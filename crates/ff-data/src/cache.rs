use std::collections::HashMap;

use ff_types::CacheKey;
use parking_lot::RwLock;

/// Score memo keyed by rounded parameter vectors
#[derive(Debug, Default)]
pub struct ScoreCache {
    entries: RwLock<HashMap<CacheKey, f64>>,
    stats: RwLock<CacheStats>,
}

impl ScoreCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from previously persisted evaluations. Later entries win.
    pub fn from_entries<I: IntoIterator<Item = (CacheKey, f64)>>(entries: I) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<f64> {
        let found = self.entries.read().get(key).copied();

        // Update stats
        {
            let mut stats = self.stats.write();
            match found {
                Some(_) => stats.hits += 1,
                None => stats.misses += 1,
            }
        }

        found
    }

    pub fn insert(&self, key: CacheKey, score: f64) {
        self.entries.write().insert(key, score);
        self.stats.write().stores += 1;
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
        *self.stats.write() = CacheStats::default();
    }

    pub fn get_stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff_types::{CoefficientDef, KeyPrecision, ParameterLayout};

    fn key(x: f64) -> CacheKey {
        let layout = ParameterLayout::new(vec![CoefficientDef::exponent(1, -10.0, 10.0, 0.0)]).unwrap();
        let params = layout.decode(&[x]).unwrap();
        layout.cache_key(&params, &KeyPrecision::default())
    }

    #[test]
    fn test_cache_basic_operations() {
        let cache = ScoreCache::new();
        assert!(cache.get(&key(1.0)).is_none());

        cache.insert(key(1.0), 42.0);
        assert_eq!(cache.get(&key(1.0)), Some(42.0));
        assert_eq!(cache.get(&key(1.000_000_1)), Some(42.0));
        assert!(cache.contains(&key(1.0)));
        assert_eq!(cache.len(), 1);

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_seeded_cache() {
        let cache = ScoreCache::from_entries(vec![(key(2.0), 5.0), (key(2.0), 3.0)]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key(2.0)), Some(3.0));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get_stats(), CacheStats::default());
    }
}
