//! Typed change-notification channels.
//!
//! A [`Signal<A>`] is a cloneable handle to shared subscriber storage.
//! Subscribers are stored as weak references; the strong end lives in the
//! [`Subscription`] guard handed back by [`Signal::subscribe`], so dropping
//! the guard disconnects the callback. Emission is synchronous on the
//! calling thread and visits live subscribers in registration order.
//!
//! [`QueuedDispatch`] provides deferred emission for handlers that need to
//! mutate the collection they were notified about: work deferred inside a
//! dispatch scope runs in FIFO order once the outermost scope is dropped.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

type CallbackRc<A> = Rc<dyn Fn(&A)>;
type CallbackWeak<A> = Weak<dyn Fn(&A)>;

/// A named, typed notification channel.
pub struct Signal<A> {
    subscribers: Rc<RefCell<Vec<CallbackWeak<A>>>>,
}

impl<A> Clone for Signal<A> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Rc::clone(&self.subscribers),
        }
    }
}

impl<A> Default for Signal<A> {
    fn default() -> Self {
        Self {
            subscribers: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl<A> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.subscribers.borrow().len())
            .finish()
    }
}

impl<A: 'static> Signal<A> {
    /// Creates a signal with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. The callback stays connected as long as the
    /// returned guard is alive.
    #[must_use = "dropping the Subscription disconnects the callback"]
    pub fn subscribe(&self, callback: impl Fn(&A) + 'static) -> Subscription {
        let strong: CallbackRc<A> = Rc::new(callback);
        self.subscribers.borrow_mut().push(Rc::downgrade(&strong));
        Subscription {
            _guard: Box::new(strong),
        }
    }

    /// Re-emits every value of this signal on `target`.
    #[must_use = "dropping the Subscription disconnects the forwarding"]
    pub fn forward_to(&self, target: &Signal<A>) -> Subscription {
        let target = target.clone();
        self.subscribe(move |value| target.emit(value))
    }

    /// Notifies every live subscriber.
    ///
    /// Subscribers are collected before any of them runs, so a callback may
    /// emit other signals or subscribe new callbacks on this one.
    pub fn emit(&self, value: &A) {
        let callbacks: Vec<CallbackRc<A>> = {
            let mut subscribers = self.subscribers.borrow_mut();
            subscribers.retain(|weak| weak.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };
        for callback in &callbacks {
            callback(value);
        }
    }

    /// Emits through [`QueuedDispatch`]: immediately when no dispatch scope
    /// is open, otherwise once the outermost scope closes.
    pub fn emit_queued(&self, value: A) {
        let signal = self.clone();
        QueuedDispatch::defer(move || signal.emit(&value));
    }

    /// Number of connected subscribers (disconnected ones are pruned first).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.borrow_mut();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.len()
    }
}

/// RAII guard keeping a subscriber callback connected.
pub struct Subscription {
    _guard: Box<dyn std::any::Any>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

type Deferred = Box<dyn FnOnce()>;

thread_local! {
    static DISPATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
    static DISPATCH_QUEUE: RefCell<VecDeque<Deferred>> = RefCell::new(VecDeque::new());
}

/// Deferred-emit scope.
///
/// While at least one scope is alive on the current thread, work passed to
/// [`QueuedDispatch::defer`] is queued instead of run. Nested scopes are
/// allowed; only the outermost one flushes.
pub struct QueuedDispatch {
    _not_send: PhantomData<*const ()>,
}

impl QueuedDispatch {
    /// Opens a dispatch scope.
    #[must_use = "the queue flushes when the scope is dropped"]
    pub fn scope() -> Self {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }

    /// Returns true if a dispatch scope is open on this thread.
    #[must_use]
    pub fn is_queuing() -> bool {
        DISPATCH_DEPTH.with(Cell::get) > 0
    }

    /// Runs `f` now, or after the outermost open scope closes.
    pub fn defer(f: impl FnOnce() + 'static) {
        if Self::is_queuing() {
            DISPATCH_QUEUE.with(|queue| queue.borrow_mut().push_back(Box::new(f)));
        } else {
            f();
        }
    }

    fn flush() {
        loop {
            let next = DISPATCH_QUEUE.with(|queue| queue.borrow_mut().pop_front());
            match next {
                Some(work) => work(),
                None => break,
            }
        }
    }
}

impl Drop for QueuedDispatch {
    fn drop(&mut self) {
        let remaining = DISPATCH_DEPTH.with(|depth| {
            let value = depth.get().saturating_sub(1);
            depth.set(value);
            value
        });
        if remaining == 0 {
            Self::flush();
        }
    }
}

impl fmt::Debug for QueuedDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedDispatch")
            .field("depth", &DISPATCH_DEPTH.with(Cell::get))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_and_emit() {
        let signal = Signal::<usize>::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let _sub = signal.subscribe(move |v| sink.borrow_mut().push(*v));

        signal.emit(&3);
        signal.emit(&7);
        assert_eq!(*seen.borrow(), vec![3, 7]);
    }

    #[test]
    fn test_drop_subscription_disconnects() {
        let signal = Signal::<()>::new();
        let count = Rc::new(Cell::new(0));
        let counter = Rc::clone(&count);
        let sub = signal.subscribe(move |()| counter.set(counter.get() + 1));

        signal.emit(&());
        drop(sub);
        signal.emit(&());
        assert_eq!(count.get(), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn test_registration_order() {
        let signal = Signal::<()>::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let a = Rc::clone(&order);
        let b = Rc::clone(&order);
        let _s1 = signal.subscribe(move |()| a.borrow_mut().push("first"));
        let _s2 = signal.subscribe(move |()| b.borrow_mut().push("second"));
        signal.emit(&());
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn test_forwarding() {
        let source = Signal::<usize>::new();
        let target = Signal::<usize>::new();
        let seen = Rc::new(Cell::new(0));
        let sink = Rc::clone(&seen);
        let _t = target.subscribe(move |v| sink.set(*v));
        let link = source.forward_to(&target);

        source.emit(&5);
        assert_eq!(seen.get(), 5);
        drop(link);
        source.emit(&9);
        assert_eq!(seen.get(), 5);
    }

    #[test]
    fn test_queued_dispatch_defers_until_scope_end() {
        let signal = Signal::<usize>::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let _sub = signal.subscribe(move |v| sink.borrow_mut().push(*v));

        {
            let _outer = QueuedDispatch::scope();
            signal.emit_queued(1);
            {
                let _inner = QueuedDispatch::scope();
                signal.emit_queued(2);
            }
            assert!(seen.borrow().is_empty());
        }
        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert!(!QueuedDispatch::is_queuing());
    }

    #[test]
    fn test_defer_without_scope_runs_immediately() {
        let hit = Rc::new(Cell::new(false));
        let flag = Rc::clone(&hit);
        QueuedDispatch::defer(move || flag.set(true));
        assert!(hit.get());
    }
}
