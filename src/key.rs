// key.rs - Join key values
//! Values extracted by joiners to address indexer buckets.
//!
//! A [`KeyValue`] is totally ordered and hashable so that the same value can
//! be used by equality levels (hash maps), comparison levels (sorted maps) and
//! containment levels (set membership).

use rust_decimal::Decimal;
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    Text(Rc<str>),
    /// Several values compared together, e.g. merged equality joiners.
    Composite(Rc<[KeyValue]>),
    /// A collection, matched by the containment joiners.
    Set(Rc<BTreeSet<KeyValue>>),
}

/// One key component per indexer level, in level order.
pub type IndexKeys = SmallVec<[KeyValue; 2]>;

impl KeyValue {
    pub fn text(value: impl AsRef<str>) -> Self {
        KeyValue::Text(Rc::from(value.as_ref()))
    }

    pub fn composite(values: impl IntoIterator<Item = KeyValue>) -> Self {
        KeyValue::Composite(values.into_iter().collect::<Vec<_>>().into())
    }

    pub fn set(values: impl IntoIterator<Item = KeyValue>) -> Self {
        KeyValue::Set(Rc::new(values.into_iter().collect()))
    }

    /// Members of this value when used as a collection: the elements of a
    /// `Set`, nothing for `Null`, and the value itself otherwise.
    pub fn members(&self) -> Vec<KeyValue> {
        match self {
            KeyValue::Set(values) => values.iter().cloned().collect(),
            KeyValue::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int(v as i64)
    }
}

impl From<u32> for KeyValue {
    fn from(v: u32) -> Self {
        KeyValue::Int(v as i64)
    }
}

impl From<usize> for KeyValue {
    fn from(v: usize) -> Self {
        KeyValue::Int(v as i64)
    }
}

impl From<bool> for KeyValue {
    fn from(v: bool) -> Self {
        KeyValue::Bool(v)
    }
}

impl From<Decimal> for KeyValue {
    fn from(v: Decimal) -> Self {
        KeyValue::Decimal(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::text(v)
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(Rc::from(v))
    }
}

impl<T: Into<KeyValue>> From<Option<T>> for KeyValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(KeyValue::Null, Into::into)
    }
}
