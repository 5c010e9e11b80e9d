use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;

/// Set of keys with a step currently running.
pub struct InFlight<K: Eq + Hash + Clone> {
    keys: DashMap<K, ()>,
}

impl<K: Eq + Hash + Clone> Default for InFlight<K> {
    fn default() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> InFlight<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if someone else holds it.
    pub fn try_claim(&self, key: &K) -> Option<FlightGuard<'_, K>> {
        match self.keys.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(FlightGuard {
                    owner: self,
                    key: key.clone(),
                })
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains_key(key)
    }
}

/// Releases the claim when dropped.
pub struct FlightGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a InFlight<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for FlightGuard<'_, K> {
    fn drop(&mut self) {
        self.owner.keys.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let set = InFlight::new();

        let guard = set.try_claim(&1u64).unwrap();
        assert!(set.try_claim(&1u64).is_none());
        assert!(set.try_claim(&2u64).is_some());
        assert!(set.contains(&1));

        drop(guard);
        assert!(!set.contains(&1));
        assert!(set.try_claim(&1u64).is_some());
    }
}
