// collectors.rs

use crate::error::{Result, ScorenetError};
use crate::fact::{Fact, FactKey};
use crate::fact_impls::{FactList, FactSet};
use crate::functions::guarded_on;
use crate::tuple::Tuple;
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// What a collector needs to reverse one accumulation. Stored in the source
/// tuple's group slot, so it is a plain value rather than a closure.
#[derive(Debug, Clone)]
pub enum UndoReceipt {
    Count,
    Long(i64),
    Float(f64),
    /// The mapped value that was accumulated.
    Value(FactKey),
    /// Insertion id of a list entry.
    Entry(u64),
}

impl UndoReceipt {
    fn kind(&self) -> &'static str {
        match self {
            UndoReceipt::Count => "count",
            UndoReceipt::Long(_) => "long",
            UndoReceipt::Float(_) => "float",
            UndoReceipt::Value(_) => "value",
            UndoReceipt::Entry(_) => "entry",
        }
    }
}

/// An incremental aggregation: every `insert` returns a receipt that a later
/// `remove` uses to reverse exactly that contribution.
pub trait Collector: fmt::Debug {
    /// Accumulates a tuple and returns the receipt undoing it.
    fn insert(&mut self, tuple: &Tuple) -> Result<UndoReceipt>;

    /// Reverses a previous `insert`.
    fn remove(&mut self, receipt: UndoReceipt) -> Result<()>;

    /// The current aggregate as a fact.
    fn result_as_fact(&self) -> Rc<dyn Fact>;

    fn is_empty(&self) -> bool;
}

/// Creates a fresh collector for each new group.
pub type CollectorSupplier = Rc<dyn Fn() -> Box<dyn Collector>>;

fn wrong_receipt(collector: &str, receipt: &UndoReceipt) -> ScorenetError {
    ScorenetError::corruption(format!(
        "{} collector cannot undo a {} receipt",
        collector,
        receipt.kind()
    ))
}

fn nothing_to_remove(collector: &str) -> ScorenetError {
    ScorenetError::corruption(format!("{} collector has nothing to remove", collector))
}

/// Decrements a multiset count, dropping the entry at zero.
fn release_count<K: Ord>(counts: &mut BTreeMap<K, usize>, key: &K) -> bool {
    match counts.get_mut(key) {
        Some(count) => {
            *count -= 1;
            if *count == 0 {
                counts.remove(key);
            }
            true
        }
        None => false,
    }
}

fn release_hashed(counts: &mut HashMap<FactKey, usize>, key: &FactKey) -> bool {
    match counts.get_mut(key) {
        Some(count) => {
            *count -= 1;
            if *count == 0 {
                counts.remove(key);
            }
            true
        }
        None => false,
    }
}

#[derive(Default, Debug)]
pub struct CountCollector {
    count: usize,
}

impl Collector for CountCollector {
    #[inline]
    fn insert(&mut self, _tuple: &Tuple) -> Result<UndoReceipt> {
        self.count += 1;
        Ok(UndoReceipt::Count)
    }

    fn remove(&mut self, receipt: UndoReceipt) -> Result<()> {
        match receipt {
            UndoReceipt::Count if self.count > 0 => {
                self.count -= 1;
                Ok(())
            }
            UndoReceipt::Count => Err(nothing_to_remove("count")),
            other => Err(wrong_receipt("count", &other)),
        }
    }

    fn result_as_fact(&self) -> Rc<dyn Fact> {
        Rc::new(self.count)
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Counts distinct mapped values.
pub struct CountDistinctCollector {
    mapping: Rc<dyn Fn(&Tuple) -> Rc<dyn Fact>>,
    counts: HashMap<FactKey, usize>,
}

impl fmt::Debug for CountDistinctCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountDistinctCollector")
            .field("mapping", &"<function>")
            .field("distinct", &self.counts.len())
            .finish()
    }
}

impl Collector for CountDistinctCollector {
    fn insert(&mut self, tuple: &Tuple) -> Result<UndoReceipt> {
        let key = FactKey::new(guarded_on("count_distinct mapping", tuple, || (self.mapping)(tuple))?);
        *self.counts.entry(key.clone()).or_insert(0) += 1;
        Ok(UndoReceipt::Value(key))
    }

    fn remove(&mut self, receipt: UndoReceipt) -> Result<()> {
        match receipt {
            UndoReceipt::Value(key) => {
                if release_hashed(&mut self.counts, &key) {
                    Ok(())
                } else {
                    Err(nothing_to_remove("count_distinct"))
                }
            }
            other => Err(wrong_receipt("count_distinct", &other)),
        }
    }

    fn result_as_fact(&self) -> Rc<dyn Fact> {
        Rc::new(self.counts.len())
    }

    fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Integer sum. The receipt carries the added value, so removal does not
/// call the mapping again.
pub struct SumCollector {
    mapping: Rc<dyn Fn(&Tuple) -> i64>,
    total: i64,
    count: usize,
}

impl fmt::Debug for SumCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SumCollector")
            .field("mapping", &"<function>")
            .field("total", &self.total)
            .field("count", &self.count)
            .finish()
    }
}

impl Collector for SumCollector {
    fn insert(&mut self, tuple: &Tuple) -> Result<UndoReceipt> {
        let value = guarded_on("sum mapping", tuple, || (self.mapping)(tuple))?;
        self.total = self.total.checked_add(value).ok_or_else(|| {
            ScorenetError::overflow("sum collector", format!("{} + {}", self.total, value))
        })?;
        self.count += 1;
        Ok(UndoReceipt::Long(value))
    }

    fn remove(&mut self, receipt: UndoReceipt) -> Result<()> {
        match receipt {
            UndoReceipt::Long(_) if self.count == 0 => Err(nothing_to_remove("sum")),
            UndoReceipt::Long(value) => {
                self.total = self.total.checked_sub(value).ok_or_else(|| {
                    ScorenetError::overflow("sum collector", format!("{} - {}", self.total, value))
                })?;
                self.count -= 1;
                Ok(())
            }
            other => Err(wrong_receipt("sum", &other)),
        }
    }

    fn result_as_fact(&self) -> Rc<dyn Fact> {
        Rc::new(self.total)
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Floating point sum, or mean when `average` is set.
pub struct FloatSumCollector {
    mapping: Rc<dyn Fn(&Tuple) -> f64>,
    average: bool,
    total: f64,
    count: usize,
}

impl fmt::Debug for FloatSumCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(if self.average { "AvgCollector" } else { "FloatSumCollector" })
            .field("mapping", &"<function>")
            .field("total", &self.total)
            .field("count", &self.count)
            .finish()
    }
}

impl Collector for FloatSumCollector {
    fn insert(&mut self, tuple: &Tuple) -> Result<UndoReceipt> {
        let value = guarded_on("float sum mapping", tuple, || (self.mapping)(tuple))?;
        self.total += value;
        self.count += 1;
        Ok(UndoReceipt::Float(value))
    }

    fn remove(&mut self, receipt: UndoReceipt) -> Result<()> {
        match receipt {
            UndoReceipt::Float(_) if self.count == 0 => Err(nothing_to_remove("float sum")),
            UndoReceipt::Float(value) => {
                self.count -= 1;
                // Resetting at zero drops accumulated rounding error.
                self.total = if self.count == 0 { 0.0 } else { self.total - value };
                Ok(())
            }
            other => Err(wrong_receipt("float sum", &other)),
        }
    }

    fn result_as_fact(&self) -> Rc<dyn Fact> {
        if !self.average {
            Rc::new(self.total)
        } else if self.count == 0 {
            Rc::new(0.0f64)
        } else {
            Rc::new(self.total / self.count as f64)
        }
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Minimum or maximum of an ordered mapped value. Equal values are counted,
/// so removing one of several minima keeps the minimum.
pub struct ExtremumCollector<K> {
    mapping: Rc<dyn Fn(&Tuple) -> K>,
    counts: BTreeMap<K, usize>,
    max: bool,
}

impl<K: fmt::Debug> fmt::Debug for ExtremumCollector<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(if self.max { "MaxCollector" } else { "MinCollector" })
            .field("mapping", &"<function>")
            .field("counts", &self.counts)
            .finish()
    }
}

impl<K: Fact + Ord + Clone> Collector for ExtremumCollector<K> {
    fn insert(&mut self, tuple: &Tuple) -> Result<UndoReceipt> {
        let key = guarded_on("min/max mapping", tuple, || (self.mapping)(tuple))?;
        *self.counts.entry(key.clone()).or_insert(0) += 1;
        Ok(UndoReceipt::Value(FactKey::new(Rc::new(key))))
    }

    fn remove(&mut self, receipt: UndoReceipt) -> Result<()> {
        let name = if self.max { "max" } else { "min" };
        match receipt {
            UndoReceipt::Value(value) => {
                let key = value
                    .fact()
                    .as_any()
                    .downcast_ref::<K>()
                    .ok_or_else(|| wrong_receipt(name, &UndoReceipt::Value(value.clone())))?;
                if release_count(&mut self.counts, key) {
                    Ok(())
                } else {
                    Err(nothing_to_remove(name))
                }
            }
            other => Err(wrong_receipt(name, &other)),
        }
    }

    /// The unit fact `()` when empty.
    fn result_as_fact(&self) -> Rc<dyn Fact> {
        let extremum = if self.max {
            self.counts.keys().next_back()
        } else {
            self.counts.keys().next()
        };
        match extremum {
            Some(key) => Rc::new(key.clone()),
            None => Rc::new(()),
        }
    }

    fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Mapped values in insertion order.
pub struct ListCollector {
    mapping: Rc<dyn Fn(&Tuple) -> Rc<dyn Fact>>,
    items: BTreeMap<u64, Rc<dyn Fact>>,
    next_id: u64,
}

impl fmt::Debug for ListCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListCollector")
            .field("mapping", &"<function>")
            .field("items", &self.items.len())
            .finish()
    }
}

impl Collector for ListCollector {
    fn insert(&mut self, tuple: &Tuple) -> Result<UndoReceipt> {
        let item = guarded_on("to_list mapping", tuple, || (self.mapping)(tuple))?;
        let id = self.next_id;
        self.next_id += 1;
        self.items.insert(id, item);
        Ok(UndoReceipt::Entry(id))
    }

    fn remove(&mut self, receipt: UndoReceipt) -> Result<()> {
        match receipt {
            UndoReceipt::Entry(id) => self
                .items
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| nothing_to_remove("to_list")),
            other => Err(wrong_receipt("to_list", &other)),
        }
    }

    fn result_as_fact(&self) -> Rc<dyn Fact> {
        Rc::new(FactList(self.items.values().cloned().collect()))
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Distinct mapped values.
pub struct SetCollector {
    mapping: Rc<dyn Fn(&Tuple) -> Rc<dyn Fact>>,
    counts: HashMap<FactKey, usize>,
}

impl fmt::Debug for SetCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetCollector")
            .field("mapping", &"<function>")
            .field("distinct", &self.counts.len())
            .finish()
    }
}

impl Collector for SetCollector {
    fn insert(&mut self, tuple: &Tuple) -> Result<UndoReceipt> {
        let key = FactKey::new(guarded_on("to_set mapping", tuple, || (self.mapping)(tuple))?);
        *self.counts.entry(key.clone()).or_insert(0) += 1;
        Ok(UndoReceipt::Value(key))
    }

    fn remove(&mut self, receipt: UndoReceipt) -> Result<()> {
        match receipt {
            UndoReceipt::Value(key) => {
                if release_hashed(&mut self.counts, &key) {
                    Ok(())
                } else {
                    Err(nothing_to_remove("to_set"))
                }
            }
            other => Err(wrong_receipt("to_set", &other)),
        }
    }

    fn result_as_fact(&self) -> Rc<dyn Fact> {
        Rc::new(FactSet(self.counts.keys().cloned().collect()))
    }

    fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Factory for creating collector suppliers
pub struct Collectors;

impl Collectors {
    pub fn count() -> CollectorSupplier {
        Rc::new(|| Box::new(CountCollector::default()))
    }

    pub fn count_distinct<F>(mapping: F) -> CollectorSupplier
    where
        F: Fn(&Tuple) -> Rc<dyn Fact> + 'static,
    {
        let mapping: Rc<dyn Fn(&Tuple) -> Rc<dyn Fact>> = Rc::new(mapping);
        Rc::new(move || {
            Box::new(CountDistinctCollector {
                mapping: mapping.clone(),
                counts: HashMap::default(),
            })
        })
    }

    pub fn sum<F>(mapping: F) -> CollectorSupplier
    where
        F: Fn(&Tuple) -> i64 + 'static,
    {
        let mapping: Rc<dyn Fn(&Tuple) -> i64> = Rc::new(mapping);
        Rc::new(move || {
            Box::new(SumCollector {
                mapping: mapping.clone(),
                total: 0,
                count: 0,
            })
        })
    }

    pub fn sum_f64<F>(mapping: F) -> CollectorSupplier
    where
        F: Fn(&Tuple) -> f64 + 'static,
    {
        Self::float_sum(Rc::new(mapping), false)
    }

    pub fn average<F>(mapping: F) -> CollectorSupplier
    where
        F: Fn(&Tuple) -> f64 + 'static,
    {
        Self::float_sum(Rc::new(mapping), true)
    }

    fn float_sum(mapping: Rc<dyn Fn(&Tuple) -> f64>, average: bool) -> CollectorSupplier {
        Rc::new(move || {
            Box::new(FloatSumCollector {
                mapping: mapping.clone(),
                average,
                total: 0.0,
                count: 0,
            })
        })
    }

    pub fn min<K, F>(mapping: F) -> CollectorSupplier
    where
        K: Fact + Ord + Clone,
        F: Fn(&Tuple) -> K + 'static,
    {
        Self::extremum(Rc::new(mapping), false)
    }

    pub fn max<K, F>(mapping: F) -> CollectorSupplier
    where
        K: Fact + Ord + Clone,
        F: Fn(&Tuple) -> K + 'static,
    {
        Self::extremum(Rc::new(mapping), true)
    }

    fn extremum<K: Fact + Ord + Clone>(mapping: Rc<dyn Fn(&Tuple) -> K>, max: bool) -> CollectorSupplier {
        Rc::new(move || {
            Box::new(ExtremumCollector {
                mapping: mapping.clone(),
                counts: BTreeMap::new(),
                max,
            })
        })
    }

    pub fn to_list<F>(mapping: F) -> CollectorSupplier
    where
        F: Fn(&Tuple) -> Rc<dyn Fact> + 'static,
    {
        let mapping: Rc<dyn Fn(&Tuple) -> Rc<dyn Fact>> = Rc::new(mapping);
        Rc::new(move || {
            Box::new(ListCollector {
                mapping: mapping.clone(),
                items: BTreeMap::new(),
                next_id: 0,
            })
        })
    }

    pub fn to_set<F>(mapping: F) -> CollectorSupplier
    where
        F: Fn(&Tuple) -> Rc<dyn Fact> + 'static,
    {
        let mapping: Rc<dyn Fn(&Tuple) -> Rc<dyn Fact>> = Rc::new(mapping);
        Rc::new(move || {
            Box::new(SetCollector {
                mapping: mapping.clone(),
                counts: HashMap::default(),
            })
        })
    }
}
