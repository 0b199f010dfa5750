//! One-shot Completion Triggers
//!
//! A [`Trigger`] connects an asynchronous request (a password prompt, a
//! deactivate or quit request) with the code waiting on its result. Handlers
//! are subscribed before the trigger fires; [`Trigger::pull`] consumes the
//! trigger and runs every handler exactly once, in the order they were added.
//!
//! Because `pull` takes `self`, a pulled trigger cannot be pulled again or
//! gain new handlers. Owners that hold a pending trigger keep it in an
//! `Option` and `take()` it at the point of completion.
//!
//! # Chaining
//!
//! A second request of the same kind arriving while the first is still
//! pending is coalesced with [`Trigger::chain`]: the newcomer is pulled with
//! the same result when the original fires.
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use splash_core::Trigger;
//!
//! let order = Rc::new(RefCell::new(Vec::new()));
//!
//! let log = Rc::clone(&order);
//! let mut first: Trigger = Trigger::with_handler(move |_| log.borrow_mut().push(1));
//! let log = Rc::clone(&order);
//! first.chain(Trigger::with_handler(move |_| log.borrow_mut().push(2)));
//!
//! first.pull(None);
//! assert_eq!(*order.borrow(), vec![1, 2]);
//! ```

use std::fmt;

/// A handler subscribed to a [`Trigger`]
pub type TriggerHandler<T> = Box<dyn FnOnce(Option<&T>)>;

/// One-shot, chainable completion signal
pub struct Trigger<T = ()> {
    handlers: Vec<TriggerHandler<T>>,
}

impl<T: 'static> Trigger<T> {
    /// Create a trigger with no handlers
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Create a trigger with a single handler
    #[must_use]
    pub fn with_handler(handler: impl FnOnce(Option<&T>) + 'static) -> Self {
        let mut trigger = Self::new();
        trigger.add_handler(handler);
        trigger
    }

    /// Subscribe a handler; handlers run in the order they were added
    pub fn add_handler(&mut self, handler: impl FnOnce(Option<&T>) + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Pull `other` with this trigger's result when this trigger fires
    pub fn chain(&mut self, other: Trigger<T>) {
        self.add_handler(move |result| other.pull(result));
    }

    /// Fire the trigger, delivering `result` to every handler exactly once
    pub fn pull(self, result: Option<&T>) {
        for handler in self.handlers {
            handler(result);
        }
    }

    /// Number of directly subscribed handlers
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl<T: 'static> Default for Trigger<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Trigger<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
