//! Graph-recording scopes.
//!
//! Whether `apply` records new function nodes is controlled by a
//! thread-local stack of booleans. The top of the stack is the current
//! state (default: recording enabled); RAII guards push on entry and pop
//! on drop, so the prior state is restored even when the guarded block
//! exits early. Each thread owns an independent stack.

use std::cell::RefCell;

thread_local! {
    static BACKPROP_STACK: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
}

/// Whether new function nodes are currently recorded on this thread.
pub fn backprop_enabled() -> bool {
    BACKPROP_STACK.with(|stack| stack.borrow().last().copied().unwrap_or(true))
}

fn push(enabled: bool) {
    BACKPROP_STACK.with(|stack| stack.borrow_mut().push(enabled));
}

fn pop() {
    BACKPROP_STACK.with(|stack| {
        stack.borrow_mut().pop();
    });
}

/// RAII guard that disables graph recording in its scope.
pub struct NoBackpropGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl NoBackpropGuard {
    pub fn new() -> Self {
        push(false);
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Default for NoBackpropGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoBackpropGuard {
    fn drop(&mut self) {
        pop();
    }
}

/// RAII guard that re-enables graph recording, overriding any enclosing
/// `NoBackpropGuard`.
pub struct ForceBackpropGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ForceBackpropGuard {
    pub fn new() -> Self {
        push(true);
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Default for ForceBackpropGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ForceBackpropGuard {
    fn drop(&mut self) {
        pop();
    }
}

/// Enter a scope in which no graph edges are recorded.
///
/// ```
/// use ember_autograd::scope;
///
/// assert!(scope::backprop_enabled());
/// {
///     let _guard = scope::no_backprop_mode();
///     assert!(!scope::backprop_enabled());
/// }
/// assert!(scope::backprop_enabled());
/// ```
pub fn no_backprop_mode() -> NoBackpropGuard {
    NoBackpropGuard::new()
}

/// Enter a scope in which graph edges are recorded regardless of any
/// enclosing no-backprop scope.
pub fn force_backprop_mode() -> ForceBackpropGuard {
    ForceBackpropGuard::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_enabled() {
        assert!(backprop_enabled());
    }

    #[test]
    fn test_no_backprop_restores() {
        {
            let _guard = no_backprop_mode();
            assert!(!backprop_enabled());
            {
                let _inner = no_backprop_mode();
                assert!(!backprop_enabled());
            }
            assert!(!backprop_enabled());
        }
        assert!(backprop_enabled());
    }

    #[test]
    fn test_force_inside_no() {
        let _outer = no_backprop_mode();
        assert!(!backprop_enabled());
        {
            let _inner = force_backprop_mode();
            assert!(backprop_enabled());
        }
        assert!(!backprop_enabled());
    }

    #[test]
    fn test_restored_after_panic() {
        let result = std::panic::catch_unwind(|| {
            let _guard = no_backprop_mode();
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(backprop_enabled());
    }

    #[test]
    fn test_thread_isolation() {
        let _guard = no_backprop_mode();
        assert!(!backprop_enabled());
        let other = std::thread::spawn(backprop_enabled)
            .join()
            .expect("thread should not panic");
        assert!(other);
    }
}
