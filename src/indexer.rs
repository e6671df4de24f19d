// indexer.rs - Multi-level keyed index used by joins and existence checks
//! An [`Indexer`] maps per-level keys to buckets of entries.
//!
//! Entries are stored with the keys of their own side and queried with the
//! keys of the opposite side. Each level applies one relation between the
//! stored key and the query key:
//!
//! * `Equal` - hashed buckets, exact match (merged equality joiners use a
//!   composite key).
//! * `Comparison` - sorted buckets, `stored OP query` for `< <= > >=`.
//! * `Containment` - set membership buckets for contain / containedIn /
//!   containAny.
//!
//! An indexer with no levels is a single bucket.

use crate::error::{Result, ScorenetError};
use crate::indexed_set::{EntryHandle, IndexedSet};
use crate::joiner::JoinerType;
use crate::key::KeyValue;
use crate::random_iter::{Candidates, RandomIter};
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Bound;
use std::rc::Rc;

/// Relation applied by one indexer level, as `stored OP query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelKind {
    Equal,
    Comparison(JoinerType),
    Containment(JoinerType),
}

impl LevelKind {
    pub fn for_relation(relation: JoinerType) -> Self {
        if relation.is_comparison() {
            LevelKind::Comparison(relation)
        } else if relation.is_containment() {
            LevelKind::Containment(relation)
        } else {
            LevelKind::Equal
        }
    }
}

/// Removal handle returned by [`Indexer::put`]. Containment levels can file
/// one entry under several buckets, so a handle may name several leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHandle {
    leaves: SmallVec<[EntryHandle; 1]>,
}

impl IndexHandle {
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }
}

/// Entry types an indexer can hold: small copyable ids.
pub trait IndexEntry: Copy + Eq + Hash + Debug {}

impl<T: Copy + Eq + Hash + Debug> IndexEntry for T {}

#[derive(Debug)]
enum Level<T> {
    Leaf(IndexedSet<T>),
    Equal(FxHashMap<KeyValue, Level<T>>),
    Comparison {
        relation: JoinerType,
        buckets: BTreeMap<KeyValue, Level<T>>,
    },
    Containment {
        relation: JoinerType,
        buckets: FxHashMap<KeyValue, Level<T>>,
        /// Entries whose collection is empty; they never match a query.
        unmatched: IndexedSet<T>,
    },
}

#[derive(Debug)]
pub struct Indexer<T> {
    levels: Rc<[LevelKind]>,
    root: Level<T>,
    entry_count: usize,
}

impl<T: IndexEntry> Indexer<T> {
    pub fn new(levels: Vec<LevelKind>) -> Self {
        let levels: Rc<[LevelKind]> = levels.into();
        let root = Level::new(&levels);
        Self {
            levels,
            root,
            entry_count: 0,
        }
    }

    /// An indexer without levels: one global bucket.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    pub fn levels(&self) -> &[LevelKind] {
        &self.levels
    }

    /// Number of entries put and not yet removed.
    pub fn len(&self) -> usize {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn put(&mut self, keys: &[KeyValue], value: T) -> Result<IndexHandle> {
        self.check_keys(keys)?;
        let mut handle = IndexHandle {
            leaves: SmallVec::new(),
        };
        self.root.put(&self.levels, keys, value, &mut handle.leaves);
        self.entry_count += 1;
        Ok(handle)
    }

    /// Removes the entry put under `keys`. Fails loudly when the entry was
    /// already removed or the keys do not lead to it.
    pub fn remove(&mut self, keys: &[KeyValue], handle: &IndexHandle) -> Result<T> {
        self.check_keys(keys)?;
        let mut removed = None;
        let mut consumed = 0;
        self.root.remove(keys, handle, &mut removed, &mut consumed)?;
        if consumed != handle.leaves.len() {
            return Err(ScorenetError::corruption(format!(
                "index handle names {} leaves but keys {:?} led to {}",
                handle.leaves.len(),
                keys,
                consumed
            )));
        }
        let value = removed.ok_or_else(|| {
            ScorenetError::corruption(format!("no entry removed for keys {:?}", keys))
        })?;
        self.entry_count -= 1;
        Ok(value)
    }

    /// Number of entries matching the query keys.
    pub fn size(&self, keys: &[KeyValue]) -> usize {
        if keys.len() != self.levels.len() {
            return 0;
        }
        if self.has_contain_any() {
            return self.iter(keys).count();
        }
        self.root.size(keys)
    }

    /// Visits every entry matching the query keys, compacting buckets that
    /// have accumulated enough gaps.
    pub fn for_each(&mut self, keys: &[KeyValue], mut visitor: impl FnMut(T)) {
        if keys.len() != self.levels.len() {
            return;
        }
        self.root.for_each(keys, &mut visitor);
    }

    /// Matching entries collected in visit order.
    pub fn matches(&mut self, keys: &[KeyValue]) -> Vec<T> {
        let mut found = Vec::new();
        self.for_each(keys, |value| found.push(value));
        found
    }

    /// Sequential, non-compacting iteration over matching entries.
    pub fn iter<'a>(&'a self, keys: &'a [KeyValue]) -> Box<dyn Iterator<Item = T> + 'a> {
        if keys.len() != self.levels.len() {
            return Box::new(std::iter::empty());
        }
        self.root.iter(keys)
    }

    /// Uniform random selection among the matching entries.
    pub fn random_iter<'a, R: Rng>(
        &'a self,
        keys: &[KeyValue],
        rng: &'a mut R,
    ) -> RandomIter<'a, T, R> {
        self.random_iter_filtered(keys, rng, |_| true)
    }

    /// Uniform random selection among the matching entries accepted by `filter`.
    pub fn random_iter_filtered<'a, R: Rng>(
        &'a self,
        keys: &[KeyValue],
        rng: &'a mut R,
        filter: impl FnMut(T) -> bool + 'a,
    ) -> RandomIter<'a, T, R> {
        RandomIter::new(self.candidates(keys), rng, Some(Box::new(filter)))
    }

    fn candidates<'a>(&'a self, keys: &[KeyValue]) -> Candidates<'a, T> {
        if keys.len() != self.levels.len() {
            return Candidates::Owned(Vec::new());
        }
        if self.has_contain_any() {
            // Entries may sit in several buckets; draw from distinct matches.
            return Candidates::Owned(self.iter(keys).collect());
        }
        let mut sets = Vec::new();
        self.root.collect_sets(keys, &mut sets);
        Candidates::sets(sets)
    }

    fn has_contain_any(&self) -> bool {
        self.levels
            .iter()
            .any(|level| *level == LevelKind::Containment(JoinerType::ContainAny))
    }

    fn check_keys(&self, keys: &[KeyValue]) -> Result<()> {
        if keys.len() != self.levels.len() {
            return Err(ScorenetError::corruption(format!(
                "indexer has {} levels but got {} keys",
                self.levels.len(),
                keys.len()
            )));
        }
        Ok(())
    }
}

fn comparison_bounds(relation: JoinerType, query: &KeyValue) -> (Bound<&KeyValue>, Bound<&KeyValue>) {
    match relation {
        JoinerType::LessThan => (Bound::Unbounded, Bound::Excluded(query)),
        JoinerType::LessThanOrEqual => (Bound::Unbounded, Bound::Included(query)),
        JoinerType::GreaterThan => (Bound::Excluded(query), Bound::Unbounded),
        JoinerType::GreaterThanOrEqual => (Bound::Included(query), Bound::Unbounded),
        _ => (Bound::Included(query), Bound::Included(query)),
    }
}

/// Bucket keys an entry is filed under at a containment level.
fn stored_members(relation: JoinerType, key: &KeyValue) -> Vec<KeyValue> {
    match relation {
        JoinerType::ContainedIn => vec![key.clone()],
        _ => key.members(),
    }
}

/// Bucket keys a query visits at a containment level.
fn queried_members(relation: JoinerType, key: &KeyValue) -> Vec<KeyValue> {
    match relation {
        JoinerType::Contain => vec![key.clone()],
        _ => key.members(),
    }
}

impl<T: IndexEntry> Level<T> {
    fn new(levels: &[LevelKind]) -> Self {
        match levels.first() {
            None => Level::Leaf(IndexedSet::new()),
            Some(LevelKind::Equal) => Level::Equal(FxHashMap::default()),
            Some(LevelKind::Comparison(relation)) => Level::Comparison {
                relation: *relation,
                buckets: BTreeMap::new(),
            },
            Some(LevelKind::Containment(relation)) => Level::Containment {
                relation: *relation,
                buckets: FxHashMap::default(),
                unmatched: IndexedSet::new(),
            },
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Level::Leaf(set) => set.is_empty(),
            Level::Equal(buckets) => buckets.is_empty(),
            Level::Comparison { buckets, .. } => buckets.is_empty(),
            Level::Containment {
                buckets, unmatched, ..
            } => buckets.is_empty() && unmatched.is_empty(),
        }
    }

    fn put(
        &mut self,
        levels: &[LevelKind],
        keys: &[KeyValue],
        value: T,
        handles: &mut SmallVec<[EntryHandle; 1]>,
    ) {
        let rest = levels.get(1..).unwrap_or(&[]);
        match self {
            Level::Leaf(set) => handles.push(set.add(value)),
            Level::Equal(buckets) => buckets
                .entry(keys[0].clone())
                .or_insert_with(|| Level::new(rest))
                .put(rest, &keys[1..], value, handles),
            Level::Comparison { buckets, .. } => buckets
                .entry(keys[0].clone())
                .or_insert_with(|| Level::new(rest))
                .put(rest, &keys[1..], value, handles),
            Level::Containment {
                relation,
                buckets,
                unmatched,
            } => {
                let members = stored_members(*relation, &keys[0]);
                if members.is_empty() {
                    handles.push(unmatched.add(value));
                }
                for member in members {
                    buckets
                        .entry(member)
                        .or_insert_with(|| Level::new(rest))
                        .put(rest, &keys[1..], value, handles);
                }
            }
        }
    }

    fn remove(
        &mut self,
        keys: &[KeyValue],
        handle: &IndexHandle,
        removed: &mut Option<T>,
        consumed: &mut usize,
    ) -> Result<()> {
        match self {
            Level::Leaf(set) => remove_from_set(set, handle, removed, consumed),
            Level::Equal(buckets) => remove_from_bucket(buckets, &keys[0], keys, handle, removed, consumed),
            Level::Comparison { buckets, .. } => {
                let bucket = buckets.get_mut(&keys[0]).ok_or_else(|| missing_bucket(&keys[0]))?;
                bucket.remove(&keys[1..], handle, removed, consumed)?;
                if bucket.is_empty() {
                    buckets.remove(&keys[0]);
                }
                Ok(())
            }
            Level::Containment {
                relation,
                buckets,
                unmatched,
            } => {
                let members = stored_members(*relation, &keys[0]);
                if members.is_empty() {
                    return remove_from_set(unmatched, handle, removed, consumed);
                }
                for member in &members {
                    remove_from_bucket(buckets, member, keys, handle, removed, consumed)?;
                }
                Ok(())
            }
        }
    }

    fn size(&self, keys: &[KeyValue]) -> usize {
        match self {
            Level::Leaf(set) => set.len(),
            Level::Equal(buckets) => buckets.get(&keys[0]).map_or(0, |b| b.size(&keys[1..])),
            Level::Comparison { relation, buckets } => buckets
                .range(comparison_bounds(*relation, &keys[0]))
                .map(|(_, b)| b.size(&keys[1..]))
                .sum(),
            Level::Containment {
                relation, buckets, ..
            } => queried_members(*relation, &keys[0])
                .iter()
                .filter_map(|member| buckets.get(member))
                .map(|b| b.size(&keys[1..]))
                .sum(),
        }
    }

    fn for_each(&mut self, keys: &[KeyValue], visitor: &mut dyn FnMut(T)) {
        match self {
            Level::Leaf(set) => set.for_each(|value| visitor(value)),
            Level::Equal(buckets) => {
                if let Some(bucket) = buckets.get_mut(&keys[0]) {
                    bucket.for_each(&keys[1..], visitor);
                }
            }
            Level::Comparison { relation, buckets } => {
                for (_, bucket) in buckets.range_mut(comparison_bounds(*relation, &keys[0])) {
                    bucket.for_each(&keys[1..], visitor);
                }
            }
            Level::Containment {
                relation, buckets, ..
            } => {
                let members = queried_members(*relation, &keys[0]);
                if *relation == JoinerType::ContainAny {
                    let mut seen = FxHashSet::default();
                    for member in &members {
                        if let Some(bucket) = buckets.get_mut(member) {
                            bucket.for_each(&keys[1..], &mut |value| {
                                if seen.insert(value) {
                                    visitor(value);
                                }
                            });
                        }
                    }
                } else {
                    for member in &members {
                        if let Some(bucket) = buckets.get_mut(member) {
                            bucket.for_each(&keys[1..], visitor);
                        }
                    }
                }
            }
        }
    }

    fn iter<'a>(&'a self, keys: &'a [KeyValue]) -> Box<dyn Iterator<Item = T> + 'a> {
        match self {
            Level::Leaf(set) => Box::new(set.iter()),
            Level::Equal(buckets) => match buckets.get(&keys[0]) {
                Some(bucket) => bucket.iter(&keys[1..]),
                None => Box::new(std::iter::empty()),
            },
            Level::Comparison { relation, buckets } => Box::new(
                buckets
                    .range(comparison_bounds(*relation, &keys[0]))
                    .flat_map(move |(_, bucket)| bucket.iter(&keys[1..])),
            ),
            Level::Containment {
                relation, buckets, ..
            } => {
                let relation = *relation;
                let inner = queried_members(relation, &keys[0])
                    .into_iter()
                    .filter_map(move |member| buckets.get(&member))
                    .flat_map(move |bucket| bucket.iter(&keys[1..]));
                if relation == JoinerType::ContainAny {
                    let mut seen = FxHashSet::default();
                    Box::new(inner.filter(move |value| seen.insert(*value)))
                } else {
                    Box::new(inner)
                }
            }
        }
    }

    fn collect_sets<'a>(&'a self, keys: &[KeyValue], sets: &mut Vec<&'a IndexedSet<T>>) {
        match self {
            Level::Leaf(set) => sets.push(set),
            Level::Equal(buckets) => {
                if let Some(bucket) = buckets.get(&keys[0]) {
                    bucket.collect_sets(&keys[1..], sets);
                }
            }
            Level::Comparison { relation, buckets } => {
                for (_, bucket) in buckets.range(comparison_bounds(*relation, &keys[0])) {
                    bucket.collect_sets(&keys[1..], sets);
                }
            }
            Level::Containment {
                relation, buckets, ..
            } => {
                for member in queried_members(*relation, &keys[0]) {
                    if let Some(bucket) = buckets.get(&member) {
                        bucket.collect_sets(&keys[1..], sets);
                    }
                }
            }
        }
    }
}

fn remove_from_set<T: IndexEntry>(
    set: &mut IndexedSet<T>,
    handle: &IndexHandle,
    removed: &mut Option<T>,
    consumed: &mut usize,
) -> Result<()> {
    let leaf = handle
        .leaves
        .iter()
        .find(|leaf| leaf.set_id() == set.id())
        .ok_or_else(|| {
            ScorenetError::corruption(format!(
                "index handle has no entry in bucket {}; keys changed since put?",
                set.id()
            ))
        })?;
    let value = set.remove(*leaf)?;
    *consumed += 1;
    match removed {
        Some(previous) if *previous != value => Err(ScorenetError::corruption(format!(
            "index handle resolved to different entries {:?} and {:?}",
            previous, value
        ))),
        _ => {
            *removed = Some(value);
            Ok(())
        }
    }
}

fn remove_from_bucket<T: IndexEntry>(
    buckets: &mut FxHashMap<KeyValue, Level<T>>,
    bucket_key: &KeyValue,
    keys: &[KeyValue],
    handle: &IndexHandle,
    removed: &mut Option<T>,
    consumed: &mut usize,
) -> Result<()> {
    let bucket = buckets
        .get_mut(bucket_key)
        .ok_or_else(|| missing_bucket(bucket_key))?;
    bucket.remove(&keys[1..], handle, removed, consumed)?;
    if bucket.is_empty() {
        buckets.remove(bucket_key);
    }
    Ok(())
}

fn missing_bucket(key: &KeyValue) -> ScorenetError {
    ScorenetError::corruption(format!(
        "no bucket for key {:?}; entry already removed or keys changed since put",
        key
    ))
}
