// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! uthread implements user-level threads, multiplexed onto a single OS thread.
//!
//! Threads are created with [`create`], and run until they return, call
//! [`exit`], or give up the processor with [`yield_now`] or [`join`]. Once
//! a thread has exited, its exit value is collected by the one thread that
//! joins it, which also frees the thread's stack.
//!
//! ```no_run
//! let id = uthread::create(|| {
//!     let inner = uthread::create(|| 5).unwrap();
//!     uthread::join(inner).unwrap()
//! })
//! .unwrap();
//!
//! assert_eq!(uthread::join(id), Ok(5));
//! ```
//!
//! # Runtimes
//!
//! Each OS thread has at most one runtime, which is created the first time
//! the OS thread creates a thread, or explicitly with [`init`]. The flow of
//! execution that created the runtime becomes the bootstrap thread, with id
//! [`ThreadId::BOOTSTRAP`]. It cannot be joined, and if it calls [`exit`],
//! the process exits.
//!
//! Threads in different runtimes are entirely independent. A thread can only
//! be joined by threads in the same runtime.
//!
//! # Scheduling
//!
//! Threads are scheduled in round-robin order. By default, scheduling is
//! cooperative: a thread keeps running until it yields, joins, or exits.
//! Once [`enable_preemption`] (or [`start_preemption`]) has been called,
//! running threads are also interrupted periodically and made to yield.
//!
//! Preemption can interrupt a thread at any point outside the runtime's own
//! functions, including while it holds a lock or is inside the allocator.
//! Threads that share state with other threads must account for this.

#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]

pub mod preempt;
mod runtime;
pub mod scheduler;
pub mod thread;

use context::{Native, StackError};
use core::fmt;
use log::error;
use nix::errno::Errno;
use runtime::Runtime;
use std::cell::OnceCell;
use std::process;

pub use preempt::{DEFAULT_HZ, MAX_HZ};
pub use scheduler::Scheduler;
pub use thread::{ExitValue, Thread, ThreadId, ThreadState};

/// The default size of each thread's stack, in bytes.
///
pub const STACK_SIZE: usize = 256 * 1024;

/// The exit value of a thread whose entry point
/// panicked.
///
pub const PANIC_EXIT_CODE: ExitValue = -1;

/// Describes an error encountered while managing
/// threads.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// No thread with this id exists in the current
    /// runtime, or it has already been joined.
    UnknownThread(ThreadId),

    /// Another thread is already waiting to join this
    /// thread.
    AlreadyJoined(ThreadId),

    /// This thread can never be joined by the caller.
    /// This is either the bootstrap thread or the
    /// calling thread.
    Unjoinable(ThreadId),

    /// A thread's stack or bookkeeping could not be
    /// allocated.
    OutOfMemory,

    /// Waiting for the thread would never end, as no
    /// other thread would be able to run.
    Deadlock,

    /// The current OS thread already has a runtime.
    AlreadyInitialised,

    /// The configuration is invalid.
    InvalidConfig(&'static str),

    /// The preemption timer or signal handler could
    /// not be installed.
    Preemption(Errno),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnknownThread(id) => write!(f, "unknown thread {}", id),
            Error::AlreadyJoined(id) => write!(f, "thread {} is already being joined", id),
            Error::Unjoinable(id) => write!(f, "thread {} cannot be joined", id),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::Deadlock => write!(f, "join would deadlock"),
            Error::AlreadyInitialised => write!(f, "runtime already initialised"),
            Error::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
            Error::Preemption(errno) => write!(f, "failed to set up preemption: {}", errno),
        }
    }
}

impl std::error::Error for Error {}

impl From<StackError> for Error {
    fn from(err: StackError) -> Self {
        match err {
            StackError::TooSmall(_) => Error::InvalidConfig("stack size is too small"),
            StackError::OutOfMemory(_) => Error::OutOfMemory,
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Preemption(errno)
    }
}

/// The settings used to create a runtime.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The size of each thread's stack, in bytes.
    pub stack_size: usize,

    /// The number of preemption ticks per second of
    /// CPU time, once preemption is enabled.
    pub preempt_hz: u32,
}

impl Config {
    /// Returns the default configuration.
    ///
    pub const fn new() -> Self {
        Config {
            stack_size: STACK_SIZE,
            preempt_hz: DEFAULT_HZ,
        }
    }

    /// Sets the size of each thread's stack.
    ///
    #[must_use]
    pub const fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Sets the preemption frequency.
    ///
    #[must_use]
    pub const fn preempt_hz(mut self, preempt_hz: u32) -> Self {
        self.preempt_hz = preempt_hz;
        self
    }

    /// Checks that the configuration can be used to
    /// create a runtime.
    ///
    pub fn validate(&self) -> Result<(), Error> {
        if self.stack_size < context::MIN_STACK_SIZE {
            return Err(Error::InvalidConfig("stack size is too small"));
        }

        if self.preempt_hz == 0 {
            return Err(Error::InvalidConfig("preemption frequency must be non-zero"));
        }

        if self.preempt_hz > MAX_HZ {
            return Err(Error::InvalidConfig("preemption frequency is too high"));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

thread_local! {
    // The runtime for this OS thread, if one has been
    // created.
    static RUNTIME: OnceCell<Runtime<Native>> = const { OnceCell::new() };
}

/// Logs the given message and terminates the process.
///
/// This is used for errors from which the runtime
/// cannot recover.
///
pub(crate) fn fatal(msg: &str) -> ! {
    error!("{}", msg);
    eprintln!("uthread: {}", msg);
    process::exit(1);
}

/// Calls `f` with the current OS thread's runtime,
/// creating it with the default configuration if
/// necessary.
///
fn with_runtime<F, R>(f: F) -> R
where
    F: FnOnce(&Runtime<Native>) -> R,
{
    RUNTIME.with(|cell| {
        let runtime = cell.get_or_init(|| match Runtime::new(Config::default()) {
            Ok(runtime) => runtime,
            Err(err) => fatal(&format!("failed to create runtime: {}", err)),
        });

        f(runtime)
    })
}

/// Calls `f` with the current OS thread's runtime,
/// if it has one.
///
fn try_with_runtime<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Runtime<Native>) -> R,
{
    RUNTIME
        .try_with(|cell| cell.get().map(f))
        .ok()
        .flatten()
}

/// Creates the current OS thread's runtime with the
/// given configuration, making the caller its bootstrap
/// thread.
///
/// `init` returns [`Error::AlreadyInitialised`] if
/// the runtime already exists, which includes when
/// a thread has already been created.
///
pub fn init(config: Config) -> Result<(), Error> {
    RUNTIME.with(|cell| {
        if cell.get().is_some() {
            return Err(Error::AlreadyInitialised);
        }

        let runtime = Runtime::new(config)?;
        cell.set(runtime).map_err(|_| Error::AlreadyInitialised)
    })
}

/// Creates a new thread, which will run `entry` once
/// it is scheduled. The value `entry` returns is the
/// thread's exit value.
///
/// The new thread does not run until the calling
/// thread yields.
///
pub fn create<F>(entry: F) -> Result<ThreadId, Error>
where
    F: FnOnce() -> ExitValue + 'static,
{
    with_runtime(|runtime| runtime.spawn(Box::new(entry)))
}

/// Gives up the processor to the first ready thread
/// in round-robin order.
///
/// The calling thread keeps its place in the queue,
/// so it may be picked again straight away. If no
/// other thread is ready, `yield_now` returns
/// immediately.
///
pub fn yield_now() {
    try_with_runtime(Runtime::yield_now);
}

/// Returns the id of the calling thread.
///
pub fn current() -> ThreadId {
    try_with_runtime(Runtime::current).unwrap_or(ThreadId::BOOTSTRAP)
}

/// Exits the calling thread with the given value,
/// which is passed to the thread that joins it.
///
/// If the caller is the bootstrap thread, the process
/// exits with the given value as its status.
///
pub fn exit(value: ExitValue) -> ! {
    RUNTIME.with(|cell| {
        if let Some(runtime) = cell.get() {
            runtime.exit(value);
        }
    });

    process::exit(value);
}

/// Waits for the given thread to exit, returning its
/// exit value.
///
/// A thread can only be joined once, by a single
/// thread. Once joined, the thread is freed and its
/// id is no longer valid.
///
pub fn join(id: ThreadId) -> Result<ExitValue, Error> {
    with_runtime(|runtime| runtime.join(id))
}

/// Starts preempting threads in the current OS
/// thread's runtime, using its configured frequency.
///
pub fn enable_preemption() -> Result<(), Error> {
    with_runtime(Runtime::enable_preemption)
}

/// Stops preempting threads in the current OS thread's
/// runtime.
///
pub fn disable_preemption() {
    try_with_runtime(Runtime::disable_preemption);
}

/// Returns whether threads in the current OS thread's
/// runtime are being preempted.
///
pub fn preemption_enabled() -> bool {
    try_with_runtime(Runtime::preemption_enabled).unwrap_or(false)
}

/// Enables preemption, then turns the calling flow
/// of execution into an idle loop that yields to the
/// other threads forever.
///
/// The bootstrap thread never leaves the idle loop,
/// even once every other thread has exited. If
/// preemption cannot be enabled, the process exits.
///
pub fn start_preemption() -> ! {
    if let Err(err) = enable_preemption() {
        fatal(&format!("failed to start preemption: {}", err));
    }

    loop {
        yield_now();
        core::hint::spin_loop();
    }
}

/// Logs debug information about the threads in the
/// current OS thread's runtime.
///
pub fn debug() {
    try_with_runtime(Runtime::debug);
}

/// Called by the signal handler on each preemption
/// tick.
///
pub(crate) fn preempt_current() {
    try_with_runtime(Runtime::yield_now);
}
