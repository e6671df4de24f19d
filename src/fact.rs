// fact.rs - Fact trait
use smallvec::SmallVec;
use std::any::Any;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Core trait for all facts flowing through the network.
///
/// The trait is object-safe to allow storage in `Rc<dyn Fact>`. Equality and
/// hashing are structural: two facts with equal values are equal regardless of
/// the allocation they live in. Fact identity across update/retract is carried
/// by the session's fact handles, never by the fact value.
pub trait Fact: Debug + 'static {
    /// Returns the fact as a `&dyn Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
    /// Structural equality against another fact of any type.
    fn fact_eq(&self, other: &dyn Fact) -> bool;
    /// Structural hash, consistent with `fact_eq`.
    fn fact_hash(&self) -> u64;
    /// Name of the concrete type, used in diagnostics.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The facts carried by one tuple, in order.
pub type Facts = SmallVec<[Rc<dyn Fact>; 4]>;

/// Implements [`Fact`] for types that are `Debug + PartialEq + Eq + Hash + 'static`.
///
/// ```
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct Shift { id: u32, employee: u32 }
/// scorenet::impl_fact!(Shift);
/// ```
#[macro_export]
macro_rules! impl_fact {
    ($($T:ty),+ $(,)?) => {
        $(
            impl $crate::fact::Fact for $T {
                fn as_any(&self) -> &dyn ::std::any::Any {
                    self
                }

                fn fact_eq(&self, other: &dyn $crate::fact::Fact) -> bool {
                    other.as_any().downcast_ref::<$T>().map_or(false, |o| o == self)
                }

                fn fact_hash(&self) -> u64 {
                    use ::std::hash::{Hash, Hasher};
                    let mut hasher = ::std::collections::hash_map::DefaultHasher::new();
                    ::std::any::TypeId::of::<$T>().hash(&mut hasher);
                    self.hash(&mut hasher);
                    hasher.finish()
                }
            }
        )+
    };
}

/// Hash-compatible wrapper for fact trait objects, used as group keys and
/// distinct-value keys.
#[derive(Clone)]
pub struct FactKey(pub Rc<dyn Fact>);

impl FactKey {
    pub fn new(fact: Rc<dyn Fact>) -> Self {
        Self(fact)
    }

    pub fn fact(&self) -> &Rc<dyn Fact> {
        &self.0
    }
}

impl PartialEq for FactKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.fact_eq(other.0.as_ref())
    }
}

impl Eq for FactKey {}

impl Hash for FactKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.fact_hash());
    }
}

impl Debug for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Downcast a trait object to a concrete type.
pub fn downcast_fact<T: Fact>(fact: &dyn Fact) -> Option<&T> {
    fact.as_any().downcast_ref::<T>()
}

/// Element-wise structural equality of two fact sequences.
pub fn facts_equal(a: &[Rc<dyn Fact>], b: &[Rc<dyn Fact>]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| Rc::ptr_eq(x, y) || x.fact_eq(y.as_ref()))
}

/// Debug rendering of a fact sequence for error messages.
pub fn describe_facts(facts: &[Rc<dyn Fact>]) -> String {
    let rendered: Vec<String> = facts.iter().map(|f| format!("{:?}", f)).collect();
    format!("[{}]", rendered.join(", "))
}
