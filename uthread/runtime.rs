// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Binds a [`Scheduler`] to the flow of execution that runs its threads.
//!
//! A [`Runtime`] owns a scheduler behind a spin lock, and performs the
//! context switches the scheduler decides on. Every operation runs with
//! preemption blocked, so the lock is never contended: a tick cannot arrive
//! while it is held, and it is always released before switching threads.

use crate::preempt::{self, without_preemption};
use crate::scheduler::{Dispatch, Scheduler};
use crate::thread::{Entry, ExitValue, ThreadId};
use crate::{fatal, Config, Error, PANIC_EXIT_CODE};
use context::Platform;
use log::{info, warn};
use nix::sys::timer::Timer;
use spin::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::process;

/// The result of a call to [`Runtime::switch`].
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    /// The current thread kept running.
    Stayed,

    /// Another thread ran, and the current thread
    /// has since been resumed.
    Switched,

    /// No thread was ready to run.
    Stalled,
}

/// A scheduler, along with the state used to run its
/// threads on the current OS thread.
///
/// Threads keep a pointer to their runtime, so a runtime
/// must not move once it has created a thread.
///
pub struct Runtime<P: Platform> {
    scheduler: Mutex<Scheduler<P>>,

    // The preemption timer, while preemption is
    // enabled.
    timer: Mutex<Option<Timer>>,
}

impl<P: Platform> Runtime<P> {
    /// Returns a new runtime, with the calling flow of
    /// execution as its bootstrap thread.
    ///
    pub fn new(config: Config) -> Result<Self, Error> {
        let scheduler = Scheduler::new(config)?;

        Ok(Runtime {
            scheduler: Mutex::new(scheduler),
            timer: Mutex::new(None),
        })
    }

    /// Creates a new thread, which will run `entry`
    /// once it is scheduled.
    ///
    pub fn spawn(&self, entry: Entry) -> Result<ThreadId, Error> {
        let arg = self as *const Self as *mut ();
        without_preemption(|| {
            self.scheduler
                .lock()
                .create(entry, thread_start::<P>, arg)
        })
    }

    /// Returns the id of the currently executing thread.
    ///
    pub fn current(&self) -> ThreadId {
        without_preemption(|| self.scheduler.lock().current())
    }

    /// Picks the next thread to run and switches to it.
    ///
    /// Preemption must already be blocked.
    ///
    fn switch(&self) -> Outcome {
        // The lock is released at the end of this
        // statement, before the swap.
        let dispatch = self.scheduler.lock().schedule();
        match dispatch {
            Dispatch::Stay => Outcome::Stayed,
            Dispatch::Stalled => Outcome::Stalled,
            Dispatch::Switch { from, to } => {
                // Both contexts live in boxed threads,
                // which are only freed once they have
                // exited and been switched away from.
                unsafe { P::swap(from, to) };
                Outcome::Switched
            }
        }
    }

    /// Gives up the processor, letting the next ready
    /// thread run.
    ///
    pub fn yield_now(&self) {
        without_preemption(|| {
            self.switch();
        });
    }

    /// Exits the current thread with the given value.
    ///
    /// If the current thread is the bootstrap thread,
    /// the process exits instead.
    ///
    pub fn exit(&self, value: ExitValue) -> ! {
        preempt::disable();

        let mut scheduler = self.scheduler.lock();
        if scheduler.current() == ThreadId::BOOTSTRAP {
            drop(scheduler);
            info!("bootstrap thread exited with value {}", value);
            process::exit(value);
        }

        scheduler.exit_current(value);
        drop(scheduler);

        match self.switch() {
            Outcome::Switched => {}
            Outcome::Stayed | Outcome::Stalled => {
                fatal("thread exited with no other thread able to run")
            }
        }

        unreachable!("exited thread was rescheduled");
    }

    /// Waits for the given thread to exit, then frees it
    /// and returns its exit value.
    ///
    pub fn join(&self, target: ThreadId) -> Result<ExitValue, Error> {
        without_preemption(|| {
            self.scheduler.lock().validate_join(target)?;

            // Exit only wakes the joiner once, but check
            // the target again anyway.
            while self.scheduler.lock().block_on(target) {
                match self.switch() {
                    Outcome::Switched => {}
                    Outcome::Stayed | Outcome::Stalled => {
                        let mut scheduler = self.scheduler.lock();
                        scheduler.unblock(target);
                        warn!(
                            "thread {} cannot join thread {}: no thread is ready to run",
                            scheduler.current(),
                            target
                        );

                        return Err(Error::Deadlock);
                    }
                }
            }

            self.scheduler
                .lock()
                .reap(target)
                .ok_or(Error::UnknownThread(target))
        })
    }

    /// Starts delivering preemption ticks to the current
    /// OS thread. Enabling preemption when it is already
    /// enabled has no effect.
    ///
    pub fn enable_preemption(&self) -> Result<(), Error> {
        without_preemption(|| {
            let mut timer = self.timer.lock();
            if timer.is_none() {
                let hz = self.scheduler.lock().config().preempt_hz;
                *timer = Some(preempt::start_timer(hz)?);
            }

            Ok(())
        })
    }

    /// Stops preemption ticks. Threads must then yield
    /// voluntarily.
    ///
    pub fn disable_preemption(&self) {
        without_preemption(|| {
            if let Some(timer) = self.timer.lock().take() {
                preempt::stop_timer(timer);
            }
        });
    }

    /// Returns whether preemption ticks are being
    /// delivered.
    ///
    pub fn preemption_enabled(&self) -> bool {
        without_preemption(|| self.timer.lock().is_some())
    }

    /// Removes and returns the current thread's entry
    /// point.
    ///
    fn take_entry(&self) -> Option<Entry> {
        without_preemption(|| self.scheduler.lock().take_entry())
    }

    /// Logs debug information about the runtime's threads.
    ///
    pub fn debug(&self) {
        without_preemption(|| self.scheduler.lock().debug());
    }
}

/// The first function each new thread runs.
///
/// It is entered from the context switch with
/// preemption blocked, runs the thread's entry,
/// and exits with its return value.
///
extern "sysv64" fn thread_start<P: Platform>(arg: *mut ()) -> ! {
    // The runtime outlives all of its threads.
    let runtime = unsafe { &*(arg as *const Runtime<P>) };
    let entry = match runtime.take_entry() {
        Some(entry) => entry,
        None => fatal("thread started without an entry point"),
    };

    preempt::enable();

    let value = panic::catch_unwind(AssertUnwindSafe(entry)).unwrap_or_else(|_| {
        warn!("thread {} panicked", runtime.current());
        PANIC_EXIT_CODE
    });

    runtime.exit(value)
}
