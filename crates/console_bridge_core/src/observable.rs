//! Observable value cell.
//!
//! `set` stores the value and then calls every registered observer synchronously, in
//! registration order. A `set` made from inside an observer is delivered to every
//! observer once the current round finishes. Handles are cheap clones sharing one
//! cell; the cell is meant to live on the console's single thread.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

type Observer<T> = Box<dyn FnMut(&T)>;

struct Inner<T> {
    value: Option<T>,
    observers: Vec<Observer<T>>,
    version: u64,
    notifying: bool,
    deferred: VecDeque<T>,
}

pub struct Observable<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Observable<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                value: None,
                observers: Vec::new(),
                version: 0,
                notifying: false,
                deferred: VecDeque::new(),
            })),
        }
    }

    pub fn subscribe(&self, observer: impl FnMut(&T) + 'static) {
        self.inner.borrow_mut().observers.push(Box::new(observer));
    }

    /// Number of writes so far.
    pub fn version(&self) -> u64 {
        self.inner.borrow().version
    }

    pub fn is_set(&self) -> bool {
        self.inner.borrow().value.is_some()
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().value = None;
    }
}

impl<T: Clone> Observable<T> {
    pub fn set(&self, value: T) {
        // Observers are taken out while they run so they may read, subscribe to or set
        // this cell.
        let mut observers = {
            let mut inner = self.inner.borrow_mut();
            inner.value = Some(value.clone());
            inner.version += 1;
            if inner.notifying {
                inner.deferred.push_back(value);
                return;
            }
            inner.notifying = true;
            std::mem::take(&mut inner.observers)
        };

        let mut next = Some(value);
        while let Some(value) = next {
            for observer in observers.iter_mut() {
                observer(&value);
            }
            let mut inner = self.inner.borrow_mut();
            let added = std::mem::take(&mut inner.observers);
            observers.extend(added);
            next = inner.deferred.pop_front();
        }

        let mut inner = self.inner.borrow_mut();
        inner.observers = observers;
        inner.notifying = false;
    }

    pub fn get(&self) -> Option<T> {
        self.inner.borrow().value.clone()
    }
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Observable")
            .field("value", &inner.value)
            .field("observers", &inner.observers.len())
            .finish()
    }
}
