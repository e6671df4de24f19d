// fact_impls.rs - Fact implementations for primitives and collector results
use crate::fact::{facts_equal, Fact, FactKey};
use rust_decimal::Decimal;
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

crate::impl_fact!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, bool, char, String, Decimal);
crate::impl_fact!(&'static str, ());

impl Fact for f64 {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fact_eq(&self, other: &dyn Fact) -> bool {
        other
            .as_any()
            .downcast_ref::<f64>()
            .map_or(false, |a| a.to_bits() == self.to_bits())
    }

    fn fact_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        std::any::TypeId::of::<f64>().hash(&mut hasher);
        self.to_bits().hash(&mut hasher);
        hasher.finish()
    }
}

/// Ordered list of facts, produced by the `to_list` collector.
#[derive(Debug, Clone, Default)]
pub struct FactList(pub Vec<Rc<dyn Fact>>);

impl FactList {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<dyn Fact>> {
        self.0.iter()
    }
}

impl Fact for FactList {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fact_eq(&self, other: &dyn Fact) -> bool {
        other
            .as_any()
            .downcast_ref::<FactList>()
            .map_or(false, |o| facts_equal(&self.0, &o.0))
    }

    fn fact_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        std::any::TypeId::of::<FactList>().hash(&mut hasher);
        for fact in &self.0 {
            fact.fact_hash().hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Unordered set of distinct facts, produced by the `to_set` collector.
#[derive(Debug, Clone, Default)]
pub struct FactSet(pub Vec<FactKey>);

impl FactSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, fact: &dyn Fact) -> bool {
        self.0.iter().any(|k| k.0.fact_eq(fact))
    }
}

impl Fact for FactSet {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fact_eq(&self, other: &dyn Fact) -> bool {
        other.as_any().downcast_ref::<FactSet>().map_or(false, |o| {
            o.0.len() == self.0.len() && self.0.iter().all(|k| o.contains(k.0.as_ref()))
        })
    }

    fn fact_hash(&self) -> u64 {
        // Order-independent combination.
        let combined = self
            .0
            .iter()
            .fold(0u64, |acc, k| acc.wrapping_add(k.0.fact_hash()));
        let mut hasher = DefaultHasher::new();
        std::any::TypeId::of::<FactSet>().hash(&mut hasher);
        combined.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f64_fact_uses_bit_equality() {
        let a: Rc<dyn Fact> = Rc::new(1.5f64);
        let b: Rc<dyn Fact> = Rc::new(1.5f64);
        let nan: Rc<dyn Fact> = Rc::new(f64::NAN);
        assert!(a.fact_eq(b.as_ref()));
        assert!(nan.fact_eq(nan.as_ref()));
        assert_eq!(a.fact_hash(), b.fact_hash());
    }

    #[test]
    fn test_fact_set_is_order_independent() {
        let one: Rc<dyn Fact> = Rc::new(1i64);
        let two: Rc<dyn Fact> = Rc::new(2i64);
        let s1 = FactSet(vec![FactKey::new(one.clone()), FactKey::new(two.clone())]);
        let s2 = FactSet(vec![FactKey::new(two), FactKey::new(one)]);
        assert!(s1.fact_eq(&s2));
        assert_eq!(s1.fact_hash(), s2.fact_hash());
    }

    #[test]
    fn test_fact_list_is_order_sensitive() {
        let one: Rc<dyn Fact> = Rc::new(1i64);
        let two: Rc<dyn Fact> = Rc::new(2i64);
        let l1 = FactList(vec![one.clone(), two.clone()]);
        let l2 = FactList(vec![two, one]);
        assert!(!l1.fact_eq(&l2));
        assert!(l1.fact_eq(&l1.clone()));
    }
}
