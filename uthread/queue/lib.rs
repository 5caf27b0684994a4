// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a FIFO queue of opaque element handles.
//!
//! A [`Queue`] stores handles to values owned elsewhere, such as thread ids,
//! references, or reference-counted pointers. Handles are appended at the
//! tail and removed from the head in constant time. A handle can also be
//! removed from the middle of the queue with [`Queue::delete`], which finds
//! it by identity, rather than by comparing the values it refers to.
//!
//! The queue never frees the values its handles refer to. Removing a handle
//! only drops the handle itself.
//!
//! ## Identity
//!
//! The [`Identity`] trait describes when two handles refer to the same
//! element. Pointer-like handles compare their addresses, so two distinct
//! values with equal contents are never confused:
//!
//! ```
//! use queue::Queue;
//!
//! let a = 7;
//! let b = 7;
//! let mut q = Queue::new();
//! q.enqueue(&a).unwrap();
//! q.enqueue(&b).unwrap();
//!
//! q.delete(&&b).unwrap();
//! assert_eq!(q.len(), 1);
//! assert!(core::ptr::eq(q.dequeue().unwrap(), &a));
//! ```

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::sync::Arc;
use core::fmt;
use core::ops::ControlFlow;
use core::ptr::{self, NonNull};

/// Describes when two handles refer to the same
/// element.
///
/// This is deliberately weaker than [`PartialEq`]:
/// two handles are identical only if they point at
/// the same value, regardless of what that value
/// contains.
///
pub trait Identity {
    /// Returns whether `self` and `other` refer to
    /// the same element.
    ///
    fn same(&self, other: &Self) -> bool;
}

impl<T: ?Sized> Identity for &T {
    fn same(&self, other: &Self) -> bool {
        ptr::eq(*self, *other)
    }
}

impl<T: ?Sized> Identity for NonNull<T> {
    fn same(&self, other: &Self) -> bool {
        ptr::eq(self.as_ptr(), other.as_ptr())
    }
}

impl<T: ?Sized> Identity for Rc<T> {
    fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(self, other)
    }
}

impl<T: ?Sized> Identity for Arc<T> {
    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

/// Describes an error encountered while operating
/// on a queue.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The queue contains no elements.
    Empty,

    /// The requested element is not in the queue.
    NotFound,

    /// The queue could not grow to hold another
    /// element.
    OutOfMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Empty => write!(f, "queue is empty"),
            Error::NotFound => write!(f, "element not found in queue"),
            Error::OutOfMemory => write!(f, "failed to allocate space for a queue element"),
        }
    }
}

/// A first-in, first-out queue of element handles.
///
#[derive(Debug)]
pub struct Queue<T> {
    elements: VecDeque<T>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T> Queue<T> {
    /// Returns a new, empty queue.
    ///
    /// No memory is allocated until the first
    /// element is enqueued.
    ///
    pub const fn new() -> Self {
        Queue {
            elements: VecDeque::new(),
        }
    }

    /// Destroys the queue.
    ///
    /// A queue can only be destroyed once it is empty.
    /// If any elements remain, the queue is returned
    /// unchanged.
    ///
    pub fn destroy(self) -> Result<(), Self> {
        if self.elements.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Appends `item` to the tail of the queue.
    ///
    pub fn enqueue(&mut self, item: T) -> Result<(), Error> {
        self.elements
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        self.elements.push_back(item);

        Ok(())
    }

    /// Removes and returns the element at the head of
    /// the queue.
    ///
    pub fn dequeue(&mut self) -> Result<T, Error> {
        self.elements.pop_front().ok_or(Error::Empty)
    }

    /// Calls `f` on each element in insertion order.
    ///
    /// If `f` returns [`ControlFlow::Break`], iteration
    /// stops and the current element is returned.
    /// Otherwise, `iterate` visits every element and
    /// returns `None`.
    ///
    pub fn iterate<F>(&self, mut f: F) -> Option<&T>
    where
        F: FnMut(&T) -> ControlFlow<()>,
    {
        self.elements.iter().find(|item| f(item).is_break())
    }

    /// Returns an iterator over the queue, from head
    /// to tail.
    ///
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.elements.iter()
    }

    /// Returns the number of elements in the queue.
    ///
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns whether the queue is empty.
    ///
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<T: Identity> Queue<T> {
    /// Removes the first element identical to `item`.
    ///
    /// The remaining elements keep their relative
    /// order. If no element matches, the queue is
    /// left untouched.
    ///
    pub fn delete(&mut self, item: &T) -> Result<(), Error> {
        if self.elements.is_empty() {
            return Err(Error::Empty);
        }

        let index = self
            .elements
            .iter()
            .position(|other| other.same(item))
            .ok_or(Error::NotFound)?;

        // Dropping the removed handle does not
        // affect the element it refers to.
        self.elements.remove(index);

        Ok(())
    }

    /// Returns whether an element identical to `item`
    /// is in the queue.
    ///
    pub fn contains(&self, item: &T) -> bool {
        self.elements.iter().any(|other| other.same(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[derive(Debug, PartialEq)]
    struct Match {
        home: &'static str,
        away: &'static str,
    }

    fn drain<T>(q: &mut Queue<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = q.dequeue() {
            out.push(item);
        }

        out
    }

    #[test]
    fn empty_queue() {
        let mut q: Queue<&u8> = Queue::new();
        assert_eq!(q.len(), 0);
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), Err(Error::Empty));
        assert_eq!(q.delete(&&1), Err(Error::Empty));
        assert_eq!(q.iterate(|_| ControlFlow::Break(())), None);
        assert!(q.destroy().is_ok());
    }

    #[test]
    fn fifo_order() {
        let matches = [
            Match { home: "Sevilla", away: "Bayern" },
            Match { home: "Juventus", away: "Real Madrid" },
            Match { home: "Liverpool", away: "Man City" },
            Match { home: "Barcelona", away: "Roma" },
            Match { home: "Man City", away: "Liverpool" },
            Match { home: "Roma", away: "Barcelona" },
        ];

        let mut q = Queue::new();
        for m in matches[..4].iter() {
            q.enqueue(m).unwrap();
        }

        assert!(ptr::eq(q.dequeue().unwrap(), &matches[0]));
        let second = q.dequeue().unwrap();
        assert_eq!(second.home, "Juventus");
        assert_eq!(second.away, "Real Madrid");

        // Queue is now 2, 3, then 0, 1, 4, 5.
        for i in [0, 1, 4, 5] {
            q.enqueue(&matches[i]).unwrap();
        }

        q.delete(&&matches[3]).unwrap();
        let third = q.dequeue().unwrap();
        assert_eq!(third.home, "Liverpool");
        assert_eq!(q.len(), 4);

        let rest = drain(&mut q);
        let expected = [&matches[0], &matches[1], &matches[4], &matches[5]];
        assert_eq!(rest.len(), expected.len());
        for (got, want) in rest.iter().zip(expected.iter()) {
            assert!(ptr::eq(*got, *want));
        }

        assert!(q.destroy().is_ok());
    }

    #[test]
    fn destroy_non_empty() {
        let a = 1u32;
        let mut q = Queue::new();
        q.enqueue(&a).unwrap();

        let q = q.destroy().unwrap_err();
        assert_eq!(q.len(), 1);
        assert!(ptr::eq(*q.iter().next().unwrap(), &a));
    }

    #[test]
    fn delete_by_identity() {
        // Equal contents, distinct values.
        let values = [5u64, 5, 5, 5];
        let mut q = Queue::new();
        for v in values.iter() {
            q.enqueue(v).unwrap();
        }

        q.delete(&&values[2]).unwrap();
        assert_eq!(q.len(), 3);
        assert!(!q.contains(&&values[2]));

        let rest = drain(&mut q);
        assert!(ptr::eq(rest[0], &values[0]));
        assert!(ptr::eq(rest[1], &values[1]));
        assert!(ptr::eq(rest[2], &values[3]));
    }

    #[test]
    fn delete_missing() {
        let present = Rc::new("present");
        let absent = Rc::new("present");
        let mut q = Queue::new();
        q.enqueue(present.clone()).unwrap();

        assert_eq!(q.delete(&absent), Err(Error::NotFound));
        assert_eq!(q.len(), 1);
        assert!(q.contains(&present));

        q.delete(&present).unwrap();
        assert_eq!(q.delete(&present), Err(Error::Empty));
        assert_eq!(Rc::strong_count(&present), 1);
    }

    #[test]
    fn delete_interleaved_with_dequeue() {
        let values: Vec<Arc<usize>> = (0..8).map(Arc::new).collect();
        let mut q = Queue::new();
        for v in values.iter() {
            q.enqueue(v.clone()).unwrap();
        }

        q.delete(&values[0]).unwrap();
        assert_eq!(*q.dequeue().unwrap(), 1);
        q.delete(&values[7]).unwrap();
        q.delete(&values[4]).unwrap();
        assert_eq!(*q.dequeue().unwrap(), 2);
        q.enqueue(values[0].clone()).unwrap();

        let rest: Vec<usize> = drain(&mut q).iter().map(|v| **v).collect();
        assert_eq!(rest, [3, 5, 6, 0]);
    }

    #[test]
    fn iterate() {
        let values = [10u32, 20, 30, 40];
        let mut q = Queue::new();
        for v in values.iter() {
            q.enqueue(v).unwrap();
        }

        let mut visited = Vec::new();
        let found = q.iterate(|v| {
            visited.push(**v);
            if **v >= 25 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        assert!(ptr::eq(*found.unwrap(), &values[2]));
        assert_eq!(visited, [10, 20, 30]);

        visited.clear();
        let found = q.iterate(|v| {
            visited.push(**v);
            ControlFlow::Continue(())
        });

        assert_eq!(found, None);
        assert_eq!(visited, [10, 20, 30, 40]);
        assert_eq!(q.len(), 4);
    }
}
