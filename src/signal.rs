//! Explicit subscribe/unsubscribe notification fan-out.
//!
//! Handlers are kept in a [`BTreeMap`] keyed by [`SubscriptionId`], so they run in
//! subscription order. There is no automatic cleanup: a handler stays registered until
//! [`Signal::unsubscribe`] is called with its id or the signal is dropped.

use std::collections::BTreeMap;
use std::fmt;

/// Handle returned by [`Signal::subscribe`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Handler<T> = Box<dyn FnMut(&T)>;

/// A notification source with an ordered set of handlers.
///
/// # Example
///
/// ```
/// use lockstep_flow::Signal;
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let hits = Rc::new(Cell::new(0));
/// let mut signal = Signal::<u32>::new();
/// let counter = hits.clone();
/// let id = signal.subscribe(move |v| counter.set(counter.get() + *v));
///
/// signal.fire(&2);
/// assert!(signal.unsubscribe(id));
/// signal.fire(&5);
/// assert_eq!(hits.get(), 2);
/// ```
pub struct Signal<T> {
    next_id: u64,
    handlers: BTreeMap<SubscriptionId, Handler<T>>,
}

impl<T> Signal<T> {
    /// Creates a signal with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 0,
            handlers: BTreeMap::new(),
        }
    }

    /// Registers `handler` and returns the id needed to remove it again.
    pub fn subscribe(&mut self, handler: impl FnMut(&T) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.handlers.insert(id, Box::new(handler));
        id
    }

    /// Removes a handler. Returns `false` if `id` was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.handlers.remove(&id).is_some()
    }

    /// Calls every handler with `value`, in subscription order.
    pub fn fire(&mut self, value: &T) {
        for handler in self.handlers.values_mut() {
            handler(value);
        }
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Removes all handlers.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn handlers_run_in_subscription_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut signal = Signal::<i32>::new();
        for tag in 0..3 {
            let log = log.clone();
            signal.subscribe(move |v| log.borrow_mut().push((tag, *v)));
        }
        signal.fire(&7);
        assert_eq!(*log.borrow(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn unsubscribe_is_explicit_and_idempotent() {
        let mut signal = Signal::<()>::new();
        let id = signal.subscribe(|()| {});
        assert_eq!(signal.len(), 1);
        assert!(signal.unsubscribe(id));
        assert!(!signal.unsubscribe(id));
        assert!(signal.is_empty());
    }

    #[test]
    fn ids_are_not_reused() {
        let mut signal = Signal::<()>::new();
        let first = signal.subscribe(|()| {});
        signal.unsubscribe(first);
        let second = signal.subscribe(|()| {});
        assert_ne!(first, second);
    }
}
