// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements timer-driven preemption.
//!
//! When preemption is enabled, a timer measuring the OS thread's CPU time
//! delivers [`SIGNAL`] to that OS thread at a fixed frequency. The signal
//! handler's only action is to yield the current thread, so preemption uses
//! exactly the same dispatch path as a voluntary yield.
//!
//! The scheduler protects its state by blocking the signal while it runs,
//! using [`without_preemption`]. The signal mask belongs to the OS thread,
//! so it is shared by every thread in the runtime. A thread that blocks
//! the signal and then switches away is resumed by a thread that restores
//! its own mask on the way out of the scheduler.

use crate::Error;
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{
    sigaction, SaFlags, SigAction, SigEvent, SigHandler, SigSet, SigevNotify, Signal, SigmaskHow,
};
use nix::sys::time::TimeSpec;
use nix::sys::timer::{Expiration, Timer, TimerSetTimeFlags};
use nix::time::ClockId;
use nix::unistd::gettid;
use spin::Once;
use std::time::Duration;

/// The default preemption frequency, in ticks per
/// second of CPU time.
///
pub const DEFAULT_HZ: u32 = 100;

/// The highest supported preemption frequency. Any
/// higher, and the interval between ticks rounds down
/// to zero, which disarms the timer.
///
pub const MAX_HZ: u32 = 1_000_000_000;

/// The signal used to trigger preemption.
///
pub const SIGNAL: Signal = Signal::SIGVTALRM;

/// The result of installing the signal handler.
///
/// The handler is process-wide, so it is installed
/// at most once, by the first runtime to enable
/// preemption.
///
static HANDLER: Once<Result<(), Errno>> = Once::new();

fn preemption_mask() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(SIGNAL);
    mask
}

/// Blocks preemption on the current OS thread,
/// returning whether it was previously unblocked.
///
pub fn disable() -> bool {
    match preemption_mask().thread_swap_mask(SigmaskHow::SIG_BLOCK) {
        Ok(previous) => !previous.contains(SIGNAL),
        // pthread_sigmask can only fail with an invalid
        // `how` argument.
        Err(err) => unreachable!("failed to block {:?}: {}", SIGNAL, err),
    }
}

/// Unblocks preemption on the current OS thread.
///
pub fn enable() {
    if let Err(err) = preemption_mask().thread_unblock() {
        unreachable!("failed to unblock {:?}: {}", SIGNAL, err);
    }
}

/// Runs `f` with preemption blocked, restoring the
/// previous state afterwards.
///
/// Calls may be nested. Preemption is only unblocked
/// once the outermost call returns.
///
pub fn without_preemption<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let was_enabled = disable();

    let ret = f();

    if was_enabled {
        enable();
    }

    ret
}

extern "C" fn on_tick(_signal: nix::libc::c_int) {
    crate::preempt_current();
}

/// Installs the process-wide signal handler, if it
/// has not already been installed.
///
fn install_handler() -> Result<(), Error> {
    let result = HANDLER.call_once(|| {
        // SA_RESTART ensures system calls interrupted
        // by a tick resume once the thread that made
        // them is rescheduled.
        let action = SigAction::new(
            SigHandler::Handler(on_tick),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        unsafe { sigaction(SIGNAL, &action) }.map(|_| ())
    });

    (*result).map_err(Error::Preemption)
}

/// Returns the interval between ticks at the given
/// frequency.
///
fn tick_interval(hz: u32) -> TimeSpec {
    TimeSpec::from(Duration::from_secs(1) / hz.clamp(1, MAX_HZ))
}

/// Installs the signal handler if necessary, then
/// starts a timer that delivers [`SIGNAL`] to the
/// calling OS thread `hz` times per second of its
/// CPU time.
///
pub fn start_timer(hz: u32) -> Result<Timer, Error> {
    install_handler()?;

    let event = SigEvent::new(SigevNotify::SigevThreadId {
        signal: SIGNAL,
        thread_id: gettid().as_raw(),
        si_value: 0,
    });

    let mut timer = Timer::new(ClockId::CLOCK_THREAD_CPUTIME_ID, event)?;
    timer.set(
        Expiration::Interval(tick_interval(hz)),
        TimerSetTimeFlags::empty(),
    )?;

    debug!("preemption timer started at {} Hz", hz);

    Ok(timer)
}

/// Deletes a preemption timer. Any tick that is
/// already pending is still delivered and yields
/// once.
///
pub fn stop_timer(timer: Timer) {
    drop(timer);
    debug!("preemption timer stopped");
}
