//! A map which supports uniform random sampling of its entries.

use rand::seq::SliceRandom;
use rand::Rng;

use std::collections::HashMap;
use std::hash::Hash;

/// Entries live in a dense vector; a side index maps keys to positions and
/// removal swap-pops, so sampling stays uniform and O(k).
#[derive(Debug, Clone)]
pub struct SampleableMap<K: Clone + Eq + Hash, V: Clone> {
    entries: Vec<(K, V)>,
    index: HashMap<K, usize>,
}

impl<K: Clone + Eq + Hash, V: Clone> SampleableMap<K, V> {
    pub fn new() -> Self {
        SampleableMap { entries: vec![], index: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|i| &self.entries[*i].1)
    }

    /// Insert or replace, returning the previous value if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        match self.index.get(&key) {
            Some(i) => {
                let old = self.entries[*i].1.clone();
                self.entries[*i].1 = value;
                Some(old)
            }
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let i = self.index.remove(key)?;
        let (_, value) = self.entries.swap_remove(i);
        if i < self.entries.len() {
            let moved_key = self.entries[i].0.clone();
            self.index.insert(moved_key, i);
        }
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(K, V)> {
        self.entries.iter()
    }

    /// Up to `k` distinct entries, uniformly at random.
    pub fn sample(&self, k: usize) -> Vec<(K, V)> {
        let mut rng = rand::thread_rng();
        if self.entries.len() <= k {
            let mut all = self.entries.clone();
            all.shuffle(&mut rng);
            return all;
        }
        let mut picked = std::collections::HashSet::new();
        let mut out = vec![];
        while out.len() < k {
            let i = rng.gen_range(0..self.entries.len());
            if picked.insert(i) {
                out.push(self.entries[i].clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn test_insert_remove_sample() {
        let mut map: SampleableMap<u32, u32> = SampleableMap::new();
        for i in 0..10 {
            assert_eq!(None, map.insert(i, i * 10));
        }
        assert_eq!(10, map.len());
        assert_eq!(Some(&30), map.get(&3));

        assert_eq!(Some(30), map.remove(&3));
        assert_eq!(None, map.remove(&3));
        assert_eq!(9, map.len());

        let sample = map.sample(4);
        assert_eq!(4, sample.len());
        let keys: std::collections::HashSet<u32> = sample.iter().map(|(k, _)| *k).collect();
        assert_eq!(4, keys.len());
        assert!(!keys.contains(&3));

        // Sampling more than the population returns everything.
        assert_eq!(9, map.sample(100).len());
    }

    #[actix_rt::test]
    async fn test_insert_updates() {
        let mut map: SampleableMap<u32, u32> = SampleableMap::new();
        assert_eq!(None, map.insert(1, 1));
        assert_eq!(Some(1), map.insert(1, 2));
        assert_eq!(1, map.len());
        assert_eq!(Some(&2), map.get(&1));
    }
}
