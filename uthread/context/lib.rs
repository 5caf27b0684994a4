// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides the context switching capability used by the thread scheduler.
//!
//! A scheduler needs exactly three things from the platform it runs on, which
//! are described by the [`Platform`] trait:
//!
//! 1. A fixed-size [stack](Platform::alloc_stack) for each new thread.
//! 2. An initial [context](Platform::init_context) for each new thread, such
//!    that switching to it for the first time calls the thread's entry point.
//! 3. A [swap](Platform::swap) that saves the current context and resumes
//!    another.
//!
//! The scheduler itself is written against the trait, so it has no knowledge
//! of registers or calling conventions. The [`Native`] platform implements
//! the trait for x86-64, using the System V ABI.
//!
//! ## Stacks
//!
//! Each stack is a single heap allocation, described by its [`StackBounds`].
//! Stacks never grow; a thread that overflows its stack corrupts the heap.

#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![allow(unsafe_code)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("the context crate only supports x86_64");

mod stacks;
mod switch;

use std::fmt;

pub use stacks::{Stack, StackBounds, MIN_STACK_SIZE};
pub use switch::{Context, Native};

/// The function a new thread starts executing when
/// it is first resumed.
///
/// The entry point receives the argument passed to
/// [`Platform::init_context`] and must never return.
///
pub type EntryPoint = extern "sysv64" fn(arg: *mut ()) -> !;

/// Describes an error encountered while allocating
/// a stack.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackError {
    /// The requested stack size is smaller than
    /// [`MIN_STACK_SIZE`].
    TooSmall(usize),

    /// The allocator could not provide a stack of
    /// the requested size.
    OutOfMemory(usize),
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StackError::TooSmall(size) => write!(
                f,
                "stack size {} is below the minimum of {} bytes",
                size, MIN_STACK_SIZE
            ),
            StackError::OutOfMemory(size) => write!(f, "failed to allocate {} byte stack", size),
        }
    }
}

impl std::error::Error for StackError {}

/// Describes a region of memory used as a thread's
/// stack.
///
pub trait StackMemory {
    /// Returns the address range covered by the
    /// stack.
    ///
    fn bounds(&self) -> StackBounds;
}

/// The context switching capability of a platform.
///
/// Implementations must ensure that [`swap`](Self::swap)
/// is synchronous: it returns only when some other
/// context swaps back to the saved context.
///
pub trait Platform {
    /// A fixed-size stack, owned by a single thread.
    type Stack: StackMemory;

    /// The saved execution state of a thread that is
    /// not currently running.
    ///
    /// The default value is used for the thread that
    /// was already running when the scheduler started,
    /// which is filled in on its first swap.
    type Context: Default;

    /// Allocates a stack of at least `size` bytes.
    ///
    fn alloc_stack(size: usize) -> Result<Self::Stack, StackError>;

    /// Prepares a context on `stack` such that the
    /// first swap into it calls `entry(arg)`.
    ///
    fn init_context(stack: &mut Self::Stack, entry: EntryPoint, arg: *mut ()) -> Self::Context;

    /// Saves the current execution state into `current`
    /// and resumes the state saved in `next`.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid for the duration of
    /// the swap, `next` must have been produced by
    /// [`init_context`](Self::init_context) or an earlier
    /// swap, and the stack that `next` refers to must
    /// still be alive.
    ///
    unsafe fn swap(current: *mut Self::Context, next: *const Self::Context);
}
