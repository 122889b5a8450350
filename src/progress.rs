//! Progress events, observer registration and cooperative cancellation

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, TransportError};

/// Default number of lines between notifications
pub const DEFAULT_NOTIFICATION_RATE: usize = 500;

/// Progress through a byte stream, for reads and for writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileProgressEvent {
    pub lines_processed: usize,
    pub bytes_processed: u64,
    pub complete: bool,
}

impl fmt::Display for FileProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileProgressEvent [lines_processed={}, bytes_processed={}, complete={}]",
            self.lines_processed, self.bytes_processed, self.complete
        )
    }
}

/// Progress assembling line text before it is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstructProgressEvent {
    pub lines_processed: usize,
    pub complete: bool,
}

impl fmt::Display for ConstructProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConstructProgressEvent [lines_processed={}, complete={}]",
            self.lines_processed, self.complete
        )
    }
}

/// How many units of work pass between two notifications. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationRate(NonZeroUsize);

impl NotificationRate {
    pub fn new(rate: usize) -> Result<Self> {
        NonZeroUsize::new(rate).map(Self).ok_or_else(|| {
            TransportError::InvalidConfig("notification rate must be a positive number of lines".to_string())
        })
    }

    pub fn get(self) -> usize {
        self.0.get()
    }

    /// Whether the `count`th unit of work is a notification point
    pub fn is_due(self, count: usize) -> bool {
        count > 0 && count % self.0.get() == 0
    }
}

impl Default for NotificationRate {
    fn default() -> Self {
        // DEFAULT_NOTIFICATION_RATE is a non-zero constant
        Self(NonZeroUsize::MIN.saturating_add(DEFAULT_NOTIFICATION_RATE - 1))
    }
}

/// Handle returned by [`Observers::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Ordered list of progress callbacks, invoked synchronously
pub struct Observers<E> {
    next_id: u64,
    entries: Vec<(ObserverId, Box<dyn FnMut(&E)>)>,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    pub fn register<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&E) + 'static,
    {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, Box::new(observer)));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unregister(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn notify(&mut self, event: &E) {
        for (_, observer) in &mut self.entries {
            observer(event);
        }
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").field("len", &self.entries.len()).finish()
    }
}

/// Shared cancellation request, polled between units of work
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_rate_rejects_zero() {
        assert!(matches!(NotificationRate::new(0), Err(TransportError::InvalidConfig(_))));
        assert_eq!(NotificationRate::new(3).unwrap().get(), 3);
        assert_eq!(NotificationRate::default().get(), DEFAULT_NOTIFICATION_RATE);
    }

    #[test]
    fn test_rate_is_due() {
        let rate = NotificationRate::new(2).unwrap();
        assert!(!rate.is_due(0));
        assert!(!rate.is_due(1));
        assert!(rate.is_due(2));
        assert!(rate.is_due(4));
    }

    #[test]
    fn test_register_and_unregister() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut observers = Observers::new();

        let first = Rc::clone(&seen);
        let a = observers.register(move |e: &ConstructProgressEvent| first.borrow_mut().push(("a", e.lines_processed)));
        let second = Rc::clone(&seen);
        observers.register(move |e: &ConstructProgressEvent| second.borrow_mut().push(("b", e.lines_processed)));

        observers.notify(&ConstructProgressEvent { lines_processed: 1, complete: false });
        assert!(observers.unregister(a));
        assert!(!observers.unregister(a));
        observers.notify(&ConstructProgressEvent { lines_processed: 2, complete: true });

        assert_eq!(*seen.borrow(), vec![("a", 1), ("b", 1), ("b", 2)]);
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let handle = flag.clone();
        assert!(!flag.is_cancelled());
        handle.cancel();
        assert!(flag.is_cancelled());
        flag.reset();
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_event_display() {
        let e = ConstructProgressEvent { lines_processed: 5, complete: false };
        assert!(e.to_string().starts_with("ConstructProgressEvent"));
    }
}
