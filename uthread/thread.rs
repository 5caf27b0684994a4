// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains the per-thread metadata tracked by the scheduler.
//!
//! Each thread is described by a [`Thread`], which owns the thread's stack
//! and saved execution context. Threads are identified by their
//! [`ThreadId`], which is unique for the lifetime of the runtime.

use context::{Platform, StackBounds, StackMemory};
use core::cell::UnsafeCell;
use core::fmt;
use log::debug;
use queue::Identity;

/// The value a thread produces when it exits.
///
pub type ExitValue = i32;

/// The function a thread runs once it is first
/// scheduled.
///
/// Its return value becomes the thread's exit value.
///
pub type Entry = Box<dyn FnOnce() -> ExitValue>;

/// Uniquely identifies a thread within its runtime.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) u64);

impl ThreadId {
    /// BOOTSTRAP is the unique thread id for the flow
    /// of execution that was running when the runtime
    /// started.
    ///
    pub const BOOTSTRAP: Self = ThreadId(0);

    /// The id given to the first thread created.
    ///
    pub(crate) const FIRST: Self = ThreadId(1);

    /// Returns the id that follows this one.
    ///
    pub(crate) const fn next(self) -> Self {
        ThreadId(self.0 + 1)
    }

    /// Returns a numerical representation for the thread
    /// ID.
    ///
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Identity for ThreadId {
    fn same(&self, other: &Self) -> bool {
        self == other
    }
}

/// Describes the scheduling state of a thread.
///
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    /// The thread is currently executing.
    Running,

    /// The thread is able to run and waiting
    /// to be scheduled.
    Ready,

    /// The thread is waiting for another
    /// thread to exit.
    Blocked,

    /// The thread has exited and its exit
    /// value has not yet been collected.
    Zombie,
}

/// Contains the metadata for a thread of
/// execution.
///
pub struct Thread<P: Platform> {
    // This thread's unique id.
    id: ThreadId,

    // The thread's current state.
    state: ThreadState,

    // The value passed to exit. Only
    // meaningful once the thread is a zombie.
    exit_value: ExitValue,

    // The thread waiting for this thread to
    // exit, if any.
    joiner: Option<ThreadId>,

    // The thread's saved execution state.
    // While the thread is executing, this
    // value is stale. It is written by the
    // platform during a swap, outside the
    // scheduler's lock.
    context: UnsafeCell<P::Context>,

    // The thread's stack. The bootstrap
    // thread inherits the stack it was
    // already running on, so has none.
    stack: Option<P::Stack>,

    // The function to run when the thread
    // first starts.
    entry: Option<Entry>,
}

impl<P: Platform> Thread<P> {
    /// Returns the thread representing the flow of
    /// execution that bootstrapped the runtime.
    ///
    /// Its context is empty until the first time it is
    /// switched out.
    ///
    pub(crate) fn new_bootstrap() -> Self {
        Thread {
            id: ThreadId::BOOTSTRAP,
            state: ThreadState::Running,
            exit_value: 0,
            joiner: None,
            context: UnsafeCell::new(P::Context::default()),
            stack: None,
            entry: None,
        }
    }

    /// Returns a new thread, ready to run `entry` on
    /// `stack` once `context` is resumed.
    ///
    pub(crate) fn new(id: ThreadId, stack: P::Stack, context: P::Context, entry: Entry) -> Self {
        Thread {
            id,
            state: ThreadState::Ready,
            exit_value: 0,
            joiner: None,
            context: UnsafeCell::new(context),
            stack: Some(stack),
            entry: Some(entry),
        }
    }

    /// Returns the thread's unique `ThreadId`.
    ///
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns the thread's current scheduling state.
    ///
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Updates the thread's scheduling state.
    ///
    pub(crate) fn set_state(&mut self, new_state: ThreadState) {
        self.state = new_state;
    }

    /// Returns the thread's exit value, if it has
    /// exited.
    ///
    pub fn exit_value(&self) -> Option<ExitValue> {
        match self.state {
            ThreadState::Zombie => Some(self.exit_value),
            _ => None,
        }
    }

    /// Marks the thread as exited with the given value.
    ///
    pub(crate) fn set_exited(&mut self, value: ExitValue) {
        self.exit_value = value;
        self.state = ThreadState::Zombie;
    }

    /// Returns the thread waiting for this thread to
    /// exit, if any.
    ///
    pub fn joiner(&self) -> Option<ThreadId> {
        self.joiner
    }

    pub(crate) fn set_joiner(&mut self, joiner: Option<ThreadId>) {
        self.joiner = joiner;
    }

    /// Returns a pointer to the thread's saved context.
    ///
    pub(crate) fn context(&self) -> *mut P::Context {
        self.context.get()
    }

    /// Removes and returns the thread's entry point.
    ///
    pub(crate) fn take_entry(&mut self) -> Option<Entry> {
        self.entry.take()
    }

    /// Returns the bounds of the thread's stack. The
    /// bootstrap thread returns `None`.
    ///
    pub fn stack_bounds(&self) -> Option<StackBounds> {
        self.stack.as_ref().map(|stack| stack.bounds())
    }

    /// Logs debug information about the thread.
    ///
    pub fn debug(&self) {
        match self.stack_bounds() {
            None => debug!("thread {} ({:?}): no stack", self.id, self.state),
            Some(bounds) => debug!(
                "thread {} ({:?}): {} byte stack at {:#x}-{:#x}",
                self.id,
                self.state,
                bounds.size(),
                bounds.start().as_u64(),
                bounds.end().as_u64()
            ),
        }
    }
}

impl<P: Platform> fmt::Debug for Thread<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("joiner", &self.joiner)
            .field("stack", &self.stack_bounds())
            .finish()
    }
}
