//constraint_builder.rs
use crate::error::Result;
use crate::fact::Fact;
use crate::factory::ConstraintFactory;
use crate::joiner::Joiners;
use crate::key::KeyValue;
use crate::resource_limits::SessionConfig;
use crate::score::Score;
use crate::session::Session;
use crate::stream_def::Stream;
use crate::tuple::Tuple;
use std::cell::RefCell;
use std::rc::Rc;

/// Entry point for declaring constraints.
///
/// ```
/// use scorenet::prelude::*;
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct Shift { employee: u32 }
/// scorenet::impl_fact!(Shift);
///
/// let builder = ConstraintBuilder::<SimpleScore>::new();
/// builder
///     .for_each::<Shift>()
///     .penalize("shift", SimpleScore::new(1))
///     .unwrap();
/// let mut session = builder.build().unwrap();
/// session.insert(Shift { employee: 1 }).unwrap();
/// assert_eq!(session.score(), SimpleScore::new(-1));
/// ```
#[derive(Debug)]
pub struct ConstraintBuilder<S: Score> {
    factory: Rc<RefCell<ConstraintFactory<S>>>,
    config: SessionConfig,
}

impl<S: Score> ConstraintBuilder<S> {
    pub fn new() -> Self {
        Self {
            factory: Rc::new(RefCell::new(ConstraintFactory::new())),
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Every fact of type `T`.
    pub fn for_each<T: Fact>(&self) -> Stream<S> {
        ConstraintFactory::from::<T>(&self.factory)
    }

    /// Every pair of distinct facts of type `T`, each unordered pair once,
    /// ordered by the identity `id` extracts. Facts with equal ids never pair.
    pub fn for_each_unique_pair<T, F>(&self, id: F) -> Stream<S>
    where
        T: Fact,
        F: Fn(&T) -> KeyValue + 'static,
    {
        let id = Rc::new(id);
        let key = move |tuple: &Tuple| tuple.fact_as::<T>(0).map_or(KeyValue::Null, |fact| id(fact));
        let key = Rc::new(key);
        let (left, right) = (Rc::clone(&key), key);
        let stream = self.for_each::<T>();
        stream.join(
            &stream,
            vec![Joiners::less_than(move |t: &Tuple| left(t), move |t: &Tuple| right(t))],
        )
    }

    /// Runs `define` against this builder and returns the constraint's
    /// result, so declarations can be grouped per constraint.
    pub fn constraint<R>(&self, define: impl FnOnce(&Self) -> Result<R>) -> Result<&Self> {
        define(self)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Session<S>> {
        let config = self.config;
        let factory = self.factory.borrow();
        factory.build_session(&config)
    }

    /// Builds a session with a different configuration, keeping the builder
    /// for further sessions.
    pub fn build_with(&self, config: &SessionConfig) -> Result<Session<S>> {
        self.factory.borrow().build_session(config)
    }
}

impl<S: Score> Default for ConstraintBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}
