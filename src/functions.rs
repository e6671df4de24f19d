// functions.rs - User function types and guarded invocation
use crate::error::{Result, ScorenetError};
use crate::fact::{Fact, Facts};
use crate::tuple::Tuple;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

pub type Predicate = Rc<dyn Fn(&Tuple) -> bool>;
/// Residual join/exists filter over a (left, right) pair.
pub type PairPredicate = Rc<dyn Fn(&Tuple, &Tuple) -> bool>;
/// Produces the facts of an output tuple from an input tuple.
pub type Mapper = Rc<dyn Fn(&Tuple) -> Facts>;
/// Expands the last fact of a tuple into zero or more facts.
pub type Flattener = Rc<dyn Fn(&Rc<dyn Fact>) -> Vec<Rc<dyn Fact>>>;
/// Computes one group key fact.
pub type GroupKeyFn = Rc<dyn Fn(&Tuple) -> Rc<dyn Fact>>;

/// Address of a shared closure, used as its identity for node sharing.
pub fn function_id<F: ?Sized>(function: &Rc<F>) -> usize {
    Rc::as_ptr(function) as *const () as usize
}

/// Runs user code, turning a panic into a `UserCode` error that names the
/// operation and carries the facts it was evaluating.
pub(crate) fn guarded<R>(
    operation: &str,
    describe: impl FnOnce() -> String,
    call: impl FnOnce() -> R,
) -> Result<R> {
    panic::catch_unwind(AssertUnwindSafe(call))
        .map_err(|payload| ScorenetError::user_code(operation, describe(), panic_message(payload.as_ref())))
}

/// [`guarded`] for functions of a single tuple.
pub(crate) fn guarded_on<R>(operation: &str, tuple: &Tuple, call: impl FnOnce() -> R) -> Result<R> {
    guarded(operation, || tuple.describe(), call)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_panic_becomes_user_code_error() {
        let tuple = Tuple::new(smallvec![Rc::new(13i64) as Rc<dyn Fact>], 0);
        let result: Result<i64> = guarded_on("weigher", &tuple, || panic!("weight overflow"));
        match result {
            Err(ScorenetError::UserCode { operation, facts, message }) => {
                assert_eq!(operation, "weigher");
                assert!(facts.contains("13"));
                assert!(message.contains("weight overflow"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_successful_call_passes_through() {
        let tuple = Tuple::new(smallvec![Rc::new(2i64) as Rc<dyn Fact>], 0);
        let value = guarded_on("mapper", &tuple, || tuple.fact_as::<i64>(0).copied()).unwrap();
        assert_eq!(value, Some(2));
    }

    #[test]
    fn test_function_identity_follows_rc() {
        let predicate: Predicate = Rc::new(|_| true);
        let shared = predicate.clone();
        let other: Predicate = Rc::new(|_| true);
        assert_eq!(function_id(&predicate), function_id(&shared));
        assert_ne!(function_id(&predicate), function_id(&other));
    }
}
