// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Includes helpers for allocating and describing thread stacks.
//!
//! Each thread other than the initial one is given its own [`Stack`], which
//! is allocated from the heap when the thread is created and released when
//! the stack is dropped.

use crate::{StackError, StackMemory};
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use x86_64::VirtAddr;

/// The smallest stack that can be allocated.
///
/// This leaves room for the initial frame built by
/// [`init_context`](crate::Platform::init_context)
/// and a handful of function calls.
///
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// The alignment of each stack, as required by the
/// System V ABI.
///
const STACK_ALIGN: usize = 16;

/// Describes the address space used for a stack.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    start: VirtAddr,
    end: VirtAddr,
}

impl StackBounds {
    /// Returns a set of stack bounds covering `size`
    /// bytes from `start`.
    ///
    pub fn new(start: VirtAddr, size: u64) -> Self {
        StackBounds {
            start,
            end: start + (size - 1),
        }
    }

    /// Returns the smallest valid address in the stack bounds.
    /// As the stack grows downwards, this is also known as the
    /// bottom of the stack.
    ///
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Returns the largest valid address in the stack bounds.
    /// As the stack grows downwards, this is also known as the
    /// top of the stack.
    ///
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Returns the number of bytes in the stack.
    ///
    pub fn size(&self) -> u64 {
        (self.end - self.start) + 1
    }

    /// Returns whether the stack bounds include the given
    /// virtual address.
    ///
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr <= self.end
    }
}

/// A fixed-size region of heap memory used as a
/// thread's stack.
///
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    layout: Layout,
}

impl Stack {
    /// Allocates a new stack of at least `size` bytes.
    ///
    /// The size is rounded up to a multiple of the
    /// stack alignment.
    ///
    pub fn new(size: usize) -> Result<Self, StackError> {
        if size < MIN_STACK_SIZE {
            return Err(StackError::TooSmall(size));
        }

        let rounded = size
            .checked_add(STACK_ALIGN - 1)
            .ok_or(StackError::OutOfMemory(size))?
            & !(STACK_ALIGN - 1);
        let layout =
            Layout::from_size_align(rounded, STACK_ALIGN).map_err(|_| StackError::OutOfMemory(size))?;

        // The memory is left uninitialised, as
        // the stack is only ever written before
        // it is read.
        let base = unsafe { alloc(layout) };
        let base = NonNull::new(base).ok_or(StackError::OutOfMemory(size))?;

        Ok(Stack { base, layout })
    }

    /// Returns the address just past the end of the
    /// stack.
    ///
    /// This is where the stack pointer of a fresh
    /// stack starts, as the first push writes below
    /// it. The address is always 16-byte aligned.
    ///
    pub fn top(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.base.as_ptr() as *const u8) + self.layout.size() as u64
    }
}

impl StackMemory for Stack {
    fn bounds(&self) -> StackBounds {
        StackBounds::new(
            VirtAddr::from_ptr(self.base.as_ptr() as *const u8),
            self.layout.size() as u64,
        )
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
