//! Thread-local binding of the "current" model configuration.
//!
//! Pipeline functions always take their configuration explicitly; the scope
//! only exists so user callbacks running inside a pipeline step can look the
//! active configuration up without threading it through their own signatures.

use std::cell::RefCell;
use std::sync::Arc;

use crate::error::ModelError;
use crate::error::Result;
use crate::model::ModelConfig;

thread_local! {
    static ACTIVE: RefCell<Vec<Arc<ModelConfig>>> = const { RefCell::new(Vec::new()) };
}

struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Run `body` with `config` bound as the current configuration of this thread.
///
/// Scopes nest: the innermost binding wins and the previous one is restored
/// when `body` returns or unwinds.
pub fn with_config<R>(config: Arc<ModelConfig>, body: impl FnOnce() -> R) -> R {
    ACTIVE.with(|stack| stack.borrow_mut().push(config));
    let _guard = ScopeGuard;
    body()
}

/// The configuration bound by the innermost enclosing [`with_config`].
pub fn current_config() -> Result<Arc<ModelConfig>> {
    ACTIVE
        .with(|stack| stack.borrow().last().cloned())
        .ok_or(ModelError::ConfigurationNotBound)
}

pub fn is_bound() -> bool {
    ACTIVE.with(|stack| !stack.borrow().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use std::panic;
    use std::thread;

    #[test]
    fn unbound_lookup_fails() {
        assert!(!is_bound());
        assert!(matches!(
            current_config(),
            Err(ModelError::ConfigurationNotBound)
        ));
    }

    #[test]
    fn nested_scopes_shadow_and_restore() {
        let outer = Arc::new(fixtures::toy_config("outer"));
        let inner = Arc::new(fixtures::toy_config("inner"));

        with_config(Arc::clone(&outer), || {
            assert_eq!(current_config().unwrap().name(), "outer");

            with_config(Arc::clone(&inner), || {
                assert_eq!(current_config().unwrap().name(), "inner");
            });

            assert_eq!(current_config().unwrap().name(), "outer");
        });

        assert!(current_config().is_err());
    }

    #[test]
    fn binding_is_restored_after_a_panic() {
        let outer = Arc::new(fixtures::toy_config("outer"));
        let inner = Arc::new(fixtures::toy_config("inner"));

        with_config(outer, || {
            let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                with_config(inner, || panic!("callback exploded"));
            }));
            assert!(result.is_err());
            assert_eq!(current_config().unwrap().name(), "outer");
        });
    }

    #[test]
    fn threads_do_not_see_each_others_scopes() {
        let left = Arc::new(fixtures::toy_config("left"));
        let right = Arc::new(fixtures::toy_config("right"));

        thread::scope(|scope| {
            let a = scope.spawn(|| with_config(left, || current_config().unwrap().name().to_string()));
            let b = scope.spawn(|| with_config(right, || current_config().unwrap().name().to_string()));
            let c = scope.spawn(|| current_config().is_err());

            assert_eq!(a.join().unwrap(), "left");
            assert_eq!(b.join().unwrap(), "right");
            assert!(c.join().unwrap());
        });
    }
}
