//! Tracking Context
//!
//! The tracking context records which computation is currently observing
//! reads. When a cell is read while an observer frame is active, the read is
//! reported to the runtime, which registers the observer as a dependent of
//! that cell.
//!
//! The context is a thread-local stack of frames, so nested evaluation works
//! naturally: a computed that reads another computed pushes a second frame,
//! and reads inside the inner evaluation are credited to the inner observer.
//! An `untracked` frame masks every observer below it.

use std::cell::RefCell;

use smallvec::SmallVec;

use super::runtime::{self, SubscriberId};

thread_local! {
    /// Stack of observer frames for the current thread. `None` entries are
    /// masking frames pushed by [`untracked`].
    static OBSERVERS: RefCell<SmallVec<[Option<SubscriberId>; 8]>> =
        RefCell::new(SmallVec::new());
}

/// Guard that pops its observer frame when dropped, so the stack stays
/// balanced even if the observed computation panics.
pub(crate) struct ObserverGuard {
    frame: Option<SubscriberId>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        OBSERVERS.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(
                popped,
                Some(self.frame),
                "observer stack out of balance",
            );
        });
    }
}

/// Push an observer frame for the given subscriber. Reads performed while
/// the returned guard is live are credited to it.
pub(crate) fn observe(subscriber: SubscriberId) -> ObserverGuard {
    OBSERVERS.with(|stack| stack.borrow_mut().push(Some(subscriber)));
    ObserverGuard {
        frame: Some(subscriber),
    }
}

/// Run `f` with dependency tracking suspended. Reads inside `f` are not
/// credited to any observer, regardless of how deep the observer stack is.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    OBSERVERS.with(|stack| stack.borrow_mut().push(None));
    let _guard = ObserverGuard { frame: None };
    f()
}

/// The innermost observer, unless it is masked by an `untracked` frame.
pub(crate) fn current_observer() -> Option<SubscriberId> {
    OBSERVERS.with(|stack| stack.borrow().last().copied().flatten())
}

/// Report a read of `source` to the current observer, if any.
pub(crate) fn on_read(source: u64) {
    if let Some(subscriber) = current_observer() {
        runtime::record_read(source, subscriber);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_observer_by_default() {
        assert!(current_observer().is_none());
    }

    #[test]
    fn observe_and_release() {
        let id = SubscriberId::new();
        {
            let _guard = observe(id);
            assert_eq!(current_observer(), Some(id));
        }
        assert!(current_observer().is_none());
    }

    #[test]
    fn nested_observers() {
        let outer = SubscriberId::new();
        let inner = SubscriberId::new();

        let _outer_guard = observe(outer);
        assert_eq!(current_observer(), Some(outer));
        {
            let _inner_guard = observe(inner);
            assert_eq!(current_observer(), Some(inner));
        }
        assert_eq!(current_observer(), Some(outer));
    }

    #[test]
    fn untracked_masks_observer() {
        let id = SubscriberId::new();
        let _guard = observe(id);

        untracked(|| {
            assert!(current_observer().is_none());
        });

        assert_eq!(current_observer(), Some(id));
    }
}
