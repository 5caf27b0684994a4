// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! switch contains the functionality to switch between threads.
//!
//! A thread that is not running is represented by its saved stack pointer.
//! Everything else the thread needs to resume is stored on its own stack:
//! the callee-saved registers and the floating point control words pushed
//! by [`uthread_switch_stack`], followed by the address to return to.

use crate::{EntryPoint, Platform, Stack, StackError};
use std::arch::global_asm;
use std::ptr;

global_asm!(
    ".pushsection .text.uthread_switch, \"ax\"",
    ".global uthread_switch_stack",
    ".p2align 4",
    "uthread_switch_stack:",
    // Save the current thread's state onto its stack.
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "sub rsp, 8",
    "stmxcsr dword ptr [rsp]",
    "fnstcw word ptr [rsp + 4]",
    // Swap stacks.
    "mov qword ptr [rdi], rsp",
    "mov rsp, qword ptr [rsi]",
    // Restore the next thread's state from its stack.
    "ldmxcsr dword ptr [rsp]",
    "fldcw word ptr [rsp + 4]",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    ".global uthread_start_thread",
    ".p2align 4",
    "uthread_start_thread:",
    // The entry point and its argument were
    // placed in r13 and r12 by init_context.
    "mov rdi, r12",
    "call r13",
    "ud2",
    ".popsection",
);

// The following functions are implemented in the
// assembly above.
//
extern "sysv64" {
    /// uthread_switch_stack saves the current thread's
    /// state on its stack, writes the stack pointer to
    /// `current_stack_pointer`, then loads the stack
    /// pointer from `new_stack_pointer` and restores the
    /// state saved there. Its last action is to return
    /// into the new thread.
    ///
    fn uthread_switch_stack(current_stack_pointer: *mut u64, new_stack_pointer: *const u64);

    /// uthread_start_thread is the return address in the
    /// initial frame of each new thread. It calls the
    /// entry point in r13 with the argument in r12.
    ///
    /// The entry point must never return, or an invalid
    /// opcode exception will be triggered.
    ///
    fn uthread_start_thread() -> !;
}

/// The initial value of the floating point control
/// words for a new thread.
///
/// The low 32 bits are loaded into MXCSR and the next
/// 16 bits into the x87 control word. Both are the
/// values set at process start, with all exceptions
/// masked and rounding to nearest.
///
const DEFAULT_CONTROL_WORDS: u64 = 0x037f_0000_1f80;

/// The saved execution state of a thread that is not
/// running.
///
#[derive(Debug, Default)]
#[repr(C)]
pub struct Context {
    // The thread's saved stack pointer. While the
    // thread is executing, this value is stale.
    stack_pointer: u64,
}

impl Context {
    /// Returns the saved stack pointer.
    ///
    pub fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }
}

/// push_stack is used to build a new thread's stack
/// without having to drop down to assembly. This is
/// done by dynamically populating the stack, value
/// by value. These are then popped off in uthread_switch_stack
/// when switching to the new thread for the first
/// time.
///
unsafe fn push_stack(mut rsp: *mut u64, value: u64) -> *mut u64 {
    // We move the stack pointer down by 8 bytes, write
    // the value to the new space, then return the updated
    // stack pointer.
    rsp = rsp.sub(1);
    rsp.write(value);
    rsp
}

/// The x86-64 platform, using the System V ABI.
///
#[derive(Debug, Clone, Copy)]
pub struct Native;

impl Platform for Native {
    type Stack = Stack;
    type Context = Context;

    fn alloc_stack(size: usize) -> Result<Stack, StackError> {
        Stack::new(size)
    }

    fn init_context(stack: &mut Stack, entry: EntryPoint, arg: *mut ()) -> Context {
        let rsp = unsafe {
            // The top of the stack is 16-byte aligned.
            // Once uthread_switch_stack returns into
            // uthread_start_thread, the stack pointer
            // is back at the top, so the call to the
            // entry point sees a correctly aligned
            // stack.
            let mut rsp: *mut u64 = stack.top().as_mut_ptr();

            // Push uthread_start_thread and the initial
            // registers to be loaded by uthread_switch_stack.
            rsp = push_stack(rsp, uthread_start_thread as usize as u64); // RIP.
            rsp = push_stack(rsp, 0); // Initial RBP.
            rsp = push_stack(rsp, 0); // Initial RBX.
            rsp = push_stack(rsp, arg as usize as u64); // Initial R12.
            rsp = push_stack(rsp, entry as usize as u64); // Initial R13.
            rsp = push_stack(rsp, 0); // Initial R14.
            rsp = push_stack(rsp, 0); // Initial R15.
            rsp = push_stack(rsp, DEFAULT_CONTROL_WORDS); // MXCSR and x87 CW.

            rsp
        };

        Context {
            stack_pointer: rsp as u64,
        }
    }

    unsafe fn swap(current: *mut Context, next: *const Context) {
        uthread_switch_stack(
            ptr::addr_of_mut!((*current).stack_pointer),
            ptr::addr_of!((*next).stack_pointer),
        );
    }
}
