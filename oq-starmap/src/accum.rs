//! The default reduce accumulator: a mapping whose union adds per key.

use std::collections::BTreeMap;
use std::ops::Add;
use std::ops::AddAssign;
use std::ops::Deref;

use serde_derive::Deserialize;
use serde_derive::Serialize;

/// A map accumulating values by key: merging two maps unions the keys and
/// adds the values, so the result of a reduce does not depend on arrival
/// order as long as `+` commutes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumMap<K: Ord, V>(pub BTreeMap<K, V>);

impl<K: Ord, V> Default for AccumMap<K, V> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<K: Ord, V> Deref for AccumMap<K, V> {
    type Target = BTreeMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K: Ord, V: AddAssign + Default> AccumMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` under `key`, starting from the default when absent.
    pub fn add(
        &mut self,
        key: K,
        value: V,
    ) {
        *self.0.entry(key).or_default() += value;
    }

    /// Unions `other` into `self`, adding values under shared keys.
    pub fn merge(
        &mut self,
        other: AccumMap<K, V>,
    ) {
        for (key, value) in other.0 {
            self.add(key, value);
        }
    }
}

impl<K: Ord, V: AddAssign + Default> Add for AccumMap<K, V> {
    type Output = Self;

    fn add(
        mut self,
        other: Self,
    ) -> Self {
        self.merge(other);
        self
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for AccumMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<K: Ord, V> IntoIterator for AccumMap<K, V> {
    type Item = (K, V);
    type IntoIter = std::collections::btree_map::IntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// The default aggregation function for [`crate::starmap::IterResult::reduce`].
pub fn add_maps<K: Ord, V: AddAssign + Default>(
    acc: AccumMap<K, V>,
    value: AccumMap<K, V>,
) -> AccumMap<K, V> {
    acc + value
}

#[cfg(test)]
mod tests {
    use super::AccumMap;

    #[test]
    fn merge_is_order_independent() {
        let a: AccumMap<char, u64> = [('h', 1), ('l', 2)].into_iter().collect();
        let b: AccumMap<char, u64> = [('l', 1), ('o', 1)].into_iter().collect();
        let left = a.clone() + b.clone();
        let right = b + a;
        assert_eq!(left, right);
        assert_eq!(left.get(&'l'), Some(&3));
    }
}
