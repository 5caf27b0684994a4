// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a simple round robin scheduler for threads.
//!
//! A [`Scheduler`] owns every thread in a runtime, along with the ready
//! queue used to decide which thread runs next. It only does bookkeeping:
//! [`schedule`](Scheduler::schedule) decides which contexts to swap, and the
//! caller performs the swap once it has released the scheduler.
//!
//! ## The ready queue
//!
//! The ready queue holds the id of every thread that has not exited,
//! including the running thread and any blocked threads. Scheduling rotates
//! the queue from the head, skipping over threads that are not ready, until
//! it finds one that is. That thread is moved to the tail and becomes the
//! running thread.
//!
//! A thread that yields keeps its place in the queue. It is usually at the
//! tail already, having been moved there when it was scheduled. A thread
//! that has created threads since then is ahead of them, so the new threads
//! run after it yields a second time.
//!
//! ## Reclaiming threads
//!
//! A thread that exits becomes a zombie. It is removed from the ready queue
//! but remains in the thread table until another thread collects its exit
//! value with [`reap`](Scheduler::reap). Zombies that are never joined are
//! only freed when the scheduler itself is dropped.

use crate::thread::{Entry, ExitValue, Thread, ThreadId, ThreadState};
use crate::{Config, Error};
use context::{EntryPoint, Platform};
use core::ops::ControlFlow;
use log::{debug, trace};
use queue::Queue;
use std::collections::BTreeMap;

/// The outcome of a scheduling decision.
///
#[derive(Debug)]
pub enum Dispatch<C> {
    /// The current thread was chosen to keep
    /// running, so no swap is needed.
    Stay,

    /// No thread is ready to run. The current
    /// thread remains current.
    Stalled,

    /// A different thread was chosen. The caller
    /// must save the current context into `from`
    /// and resume `to`.
    Switch { from: *mut C, to: *const C },
}

/// Scheduler is a basic thread scheduler.
///
/// Currently, it implements a round-robin algorithm.
///
pub struct Scheduler<P: Platform> {
    // Every thread that has not been reaped,
    // including the bootstrap thread.
    threads: BTreeMap<ThreadId, Box<Thread<P>>>,

    // The threads that have not exited, in
    // scheduling order.
    ready: Queue<ThreadId>,

    // The thread that is currently executing.
    current: ThreadId,

    // The id for the next thread created.
    next_id: ThreadId,

    config: Config,
}

impl<P: Platform> Scheduler<P> {
    /// Returns a new scheduler, with the calling flow of
    /// execution registered as the running bootstrap
    /// thread.
    ///
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let mut ready = Queue::new();
        ready
            .enqueue(ThreadId::BOOTSTRAP)
            .map_err(|_| Error::OutOfMemory)?;

        let mut threads = BTreeMap::new();
        threads.insert(ThreadId::BOOTSTRAP, Box::new(Thread::new_bootstrap()));

        Ok(Scheduler {
            threads,
            ready,
            current: ThreadId::BOOTSTRAP,
            next_id: ThreadId::FIRST,
            config,
        })
    }

    /// Returns the configuration the scheduler was
    /// created with.
    ///
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the id of the currently executing thread.
    ///
    pub fn current(&self) -> ThreadId {
        self.current
    }

    /// Returns the thread with the given id, if it has
    /// not been reaped.
    ///
    pub fn thread(&self, id: ThreadId) -> Option<&Thread<P>> {
        self.threads.get(&id).map(|thread| &**thread)
    }

    /// Returns the scheduling state of the given thread.
    ///
    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.thread(id).map(Thread::state)
    }

    /// Returns the number of threads that have not been
    /// reaped, including the bootstrap thread.
    ///
    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Returns the ids in the ready queue, from head to
    /// tail.
    ///
    pub fn ready_queue(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.ready.iter().copied()
    }

    fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread<P>> {
        self.threads.get_mut(&id).map(|thread| &mut **thread)
    }

    // The current thread always exists, as
    // only zombies are ever removed.
    #[allow(clippy::missing_panics_doc)]
    fn current_mut(&mut self) -> &mut Thread<P> {
        let current = self.current;
        self.thread_mut(current)
            .expect("current thread missing from thread table")
    }

    /// Creates a new thread that will run `entry`, adding
    /// it to the tail of the ready queue.
    ///
    /// When the new thread is first resumed, the platform
    /// calls `start` with `arg`. It is the responsibility
    /// of `start` to retrieve the entry with [`take_entry`](Self::take_entry).
    ///
    /// The new thread's id is consumed even if creation
    /// fails, as ids are never reused.
    ///
    pub fn create(
        &mut self,
        entry: Entry,
        start: EntryPoint,
        arg: *mut (),
    ) -> Result<ThreadId, Error> {
        let id = self.next_id;
        self.next_id = id.next();

        let mut stack = P::alloc_stack(self.config.stack_size)?;
        let context = P::init_context(&mut stack, start, arg);
        self.ready.enqueue(id).map_err(|_| Error::OutOfMemory)?;
        self.threads
            .insert(id, Box::new(Thread::new(id, stack, context, entry)));

        debug!("created thread {}", id);

        Ok(id)
    }

    /// Removes and returns the current thread's entry
    /// point, if it has not already been taken.
    ///
    pub fn take_entry(&mut self) -> Option<Entry> {
        self.current_mut().take_entry()
    }

    /// Picks the next thread to run.
    ///
    /// If the current thread is running, it becomes
    /// ready, keeping its place in the ready queue.
    /// Blocked and exited threads keep their state.
    ///
    /// The ready queue is then rotated from the head,
    /// moving threads that are not ready to the tail,
    /// until a ready thread is found. That thread is
    /// moved to the tail and becomes the current thread.
    /// This may be the calling thread, if it is the
    /// first ready thread in the queue.
    ///
    #[allow(clippy::missing_panics_doc)] // Will only panic if the ready queue is inconsistent.
    pub fn schedule(&mut self) -> Dispatch<P::Context> {
        let previous = self.current;
        let current = self.current_mut();
        if current.state() == ThreadState::Running {
            current.set_state(ThreadState::Ready);
        }

        // Make sure there is something to find before
        // we start rotating.
        let threads = &self.threads;
        let any_ready = self.ready.iterate(|id| match threads.get(id) {
            Some(thread) if thread.state() == ThreadState::Ready => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        });

        if any_ready.is_none() {
            trace!("thread {}: no thread is ready to run", previous);
            return Dispatch::Stalled;
        }

        let next = loop {
            let id = self.ready.dequeue().expect("ready queue emptied while rotating");
            if self.state(id) == Some(ThreadState::Ready) {
                break id;
            }

            self.ready.enqueue(id).expect("failed to rotate ready queue");
        };

        self.ready.enqueue(next).expect("failed to requeue next thread");
        self.current = next;
        let next_thread = self.current_mut();
        next_thread.set_state(ThreadState::Running);
        let to = next_thread.context() as *const P::Context;

        if next == previous {
            return Dispatch::Stay;
        }

        trace!("switching from thread {} to thread {}", previous, next);
        let from = match self.thread(previous) {
            Some(thread) => thread.context(),
            None => unreachable!("previous thread {} vanished while scheduling", previous),
        };

        Dispatch::Switch { from, to }
    }

    /// Marks the current thread as exited with the given
    /// value, removing it from the ready queue.
    ///
    /// If another thread is waiting to join the current
    /// thread, it is made ready again.
    ///
    /// The caller must then switch away from the current
    /// thread, which will never be scheduled again.
    ///
    #[allow(clippy::missing_panics_doc)] // Will only panic if the ready queue is inconsistent.
    pub fn exit_current(&mut self, value: ExitValue) {
        let id = self.current;
        let current = self.current_mut();
        current.set_exited(value);
        let joiner = current.joiner();
        self.ready
            .delete(&id)
            .expect("exiting thread missing from ready queue");

        debug!("thread {} exited with value {}", id, value);
        if let Some(joiner) = joiner.and_then(|joiner| self.thread_mut(joiner)) {
            if joiner.state() == ThreadState::Blocked {
                joiner.set_state(ThreadState::Ready);
            }
        }
    }

    /// Checks whether the current thread may join
    /// `target`.
    ///
    /// The bootstrap thread and the current thread can
    /// never be joined. A thread can only have one
    /// joiner at a time.
    ///
    pub fn validate_join(&self, target: ThreadId) -> Result<(), Error> {
        if target == ThreadId::BOOTSTRAP || target == self.current {
            return Err(Error::Unjoinable(target));
        }

        let thread = self.thread(target).ok_or(Error::UnknownThread(target))?;
        if thread.joiner().is_some() {
            return Err(Error::AlreadyJoined(target));
        }

        // Follow the chain of joins starting at the
        // target. If it leads back to the current
        // thread, blocking would never end. Each
        // thread has at most one joiner and the
        // target has none, so the chain has no loop
        // and visits each thread at most once.
        let mut next = Some(target);
        for _ in 0..self.threads.len() {
            next = next.and_then(|id| self.waiting_on(id));
            match next {
                None => break,
                Some(id) if id == self.current => return Err(Error::Deadlock),
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Returns the thread that `id` is blocked joining,
    /// if any.
    ///
    fn waiting_on(&self, id: ThreadId) -> Option<ThreadId> {
        if self.state(id) != Some(ThreadState::Blocked) {
            return None;
        }

        self.threads
            .values()
            .find(|thread| thread.joiner() == Some(id) && thread.state() != ThreadState::Zombie)
            .map(|thread| thread.id())
    }

    /// Blocks the current thread until `target` exits.
    ///
    /// `block_on` returns `false` without blocking if
    /// the target has already exited. Otherwise, the
    /// current thread is registered as the target's
    /// joiner. The caller must then call [`schedule`](Self::schedule).
    ///
    pub fn block_on(&mut self, target: ThreadId) -> bool {
        let current = self.current;
        match self.thread_mut(target) {
            Some(thread) if thread.state() != ThreadState::Zombie => {
                thread.set_joiner(Some(current));
            }
            _ => return false,
        }

        self.current_mut().set_state(ThreadState::Blocked);
        true
    }

    /// Reverses [`block_on`](Self::block_on), returning
    /// the current thread to the running state and
    /// removing it as the target's joiner.
    ///
    pub fn unblock(&mut self, target: ThreadId) {
        let current = self.current;
        if let Some(thread) = self.thread_mut(target) {
            if thread.joiner() == Some(current) {
                thread.set_joiner(None);
            }
        }

        let current = self.current_mut();
        if current.state() == ThreadState::Blocked {
            current.set_state(ThreadState::Running);
        }
    }

    /// Frees an exited thread, returning its exit value.
    ///
    /// `reap` returns `None` and leaves the thread in
    /// place if it has not exited.
    ///
    pub fn reap(&mut self, target: ThreadId) -> Option<ExitValue> {
        let value = self.thread(target)?.exit_value()?;
        self.threads.remove(&target);
        debug!("thread {} reaped by thread {}", target, self.current);

        Some(value)
    }

    /// Logs debug information about every thread, in
    /// ready queue order, followed by any zombies.
    ///
    pub fn debug(&self) {
        debug!(
            "{} threads, thread {} running",
            self.threads.len(),
            self.current
        );
        for id in self.ready.iter() {
            if let Some(thread) = self.thread(*id) {
                thread.debug();
            }
        }

        for thread in self.threads.values() {
            if thread.state() == ThreadState::Zombie {
                thread.debug();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context::{Stack, StackError};

    /// A platform whose contexts are never resumed, so
    /// scheduling decisions can be inspected directly.
    ///
    struct Recording;

    impl Platform for Recording {
        type Stack = Stack;
        type Context = usize;

        fn alloc_stack(size: usize) -> Result<Stack, StackError> {
            Stack::new(size)
        }

        fn init_context(_stack: &mut Stack, _entry: EntryPoint, arg: *mut ()) -> usize {
            arg as usize
        }

        unsafe fn swap(_current: *mut usize, _next: *const usize) {}
    }

    extern "sysv64" fn never_started(_arg: *mut ()) -> ! {
        unreachable!("recorded threads are never started");
    }

    fn new_scheduler() -> Scheduler<Recording> {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = Config::new().stack_size(context::MIN_STACK_SIZE);
        Scheduler::new(config).unwrap()
    }

    fn spawn(scheduler: &mut Scheduler<Recording>, value: ExitValue) -> ThreadId {
        scheduler
            .create(Box::new(move || value), never_started, core::ptr::null_mut())
            .unwrap()
    }

    /// Schedules the next thread and returns which
    /// thread is now current.
    ///
    fn switch(scheduler: &mut Scheduler<Recording>) -> ThreadId {
        match scheduler.schedule() {
            Dispatch::Stalled => panic!("scheduler stalled"),
            Dispatch::Stay | Dispatch::Switch { .. } => scheduler.current(),
        }
    }

    fn queue(scheduler: &Scheduler<Recording>) -> Vec<u64> {
        scheduler.ready_queue().map(|id| id.as_u64()).collect()
    }

    #[test]
    fn bootstrap_only() {
        let mut scheduler = new_scheduler();
        assert_eq!(scheduler.current(), ThreadId::BOOTSTRAP);
        assert_eq!(scheduler.state(ThreadId::BOOTSTRAP), Some(ThreadState::Running));
        assert_eq!(scheduler.num_threads(), 1);

        // Yielding with nothing else to run is a no-op.
        assert!(matches!(scheduler.schedule(), Dispatch::Stay));
        assert_eq!(scheduler.current(), ThreadId::BOOTSTRAP);
        assert_eq!(scheduler.state(ThreadId::BOOTSTRAP), Some(ThreadState::Running));
        assert_eq!(queue(&scheduler), [0]);
    }

    #[test]
    fn ids_increase_from_one() {
        let mut scheduler = new_scheduler();
        let ids: Vec<u64> = (0..5).map(|i| spawn(&mut scheduler, i).as_u64()).collect();
        assert_eq!(ids, [1, 2, 3, 4, 5]);
        assert_eq!(queue(&scheduler), [0, 1, 2, 3, 4, 5]);
        for id in 1..=5 {
            assert_eq!(scheduler.state(ThreadId(id)), Some(ThreadState::Ready));
        }
    }

    #[test]
    fn round_robin() {
        let mut scheduler = new_scheduler();
        for i in 0..3 {
            spawn(&mut scheduler, i);
        }

        // The bootstrap thread is at the head of the
        // queue, so it is the first to be picked.
        let order: Vec<u64> = (0..8).map(|_| switch(&mut scheduler).as_u64()).collect();
        assert_eq!(order, [0, 1, 2, 3, 0, 1, 2, 3]);

        // Exactly one thread is running.
        let running = (0..=3)
            .filter(|id| scheduler.state(ThreadId(*id)) == Some(ThreadState::Running))
            .count();
        assert_eq!(running, 1);
    }

    #[test]
    fn yield_after_create() {
        let mut scheduler = new_scheduler();
        let a = spawn(&mut scheduler, 1);
        let b = spawn(&mut scheduler, 2);
        assert_eq!(switch(&mut scheduler), ThreadId::BOOTSTRAP);
        assert_eq!(switch(&mut scheduler), a);

        // A thread created by a sits behind it in the
        // queue, and a keeps its place when it yields.
        let c = spawn(&mut scheduler, 3);
        assert_eq!(queue(&scheduler), [b.as_u64(), 0, a.as_u64(), c.as_u64()]);

        let order: Vec<ThreadId> = (0..4).map(|_| switch(&mut scheduler)).collect();
        assert_eq!(order, [b, ThreadId::BOOTSTRAP, a, c]);
        assert_eq!(queue(&scheduler), [b.as_u64(), 0, a.as_u64(), c.as_u64()]);
    }

    #[test]
    fn switch_contexts() {
        let mut scheduler = new_scheduler();
        let arg = 0x1234usize as *mut ();
        let id = scheduler
            .create(Box::new(|| 0), never_started, arg)
            .unwrap();

        assert!(matches!(scheduler.schedule(), Dispatch::Stay));
        assert_eq!(queue(&scheduler), [1, 0]);
        match scheduler.schedule() {
            Dispatch::Switch { from, to } => unsafe {
                assert_eq!(*to, 0x1234);
                assert_eq!(*from, 0);
            },
            other => panic!("unexpected dispatch {:?}", other),
        }

        assert_eq!(scheduler.current(), id);
        assert_eq!(scheduler.state(ThreadId::BOOTSTRAP), Some(ThreadState::Ready));
        assert!(scheduler.take_entry().is_some());
        assert!(scheduler.take_entry().is_none());
    }

    #[test]
    fn blocked_threads_are_skipped() {
        let mut scheduler = new_scheduler();
        let a = spawn(&mut scheduler, 1);
        let b = spawn(&mut scheduler, 2);

        // The bootstrap thread waits for b.
        scheduler.validate_join(b).unwrap();
        assert!(scheduler.block_on(b));
        assert_eq!(switch(&mut scheduler), a);
        assert_eq!(switch(&mut scheduler), b);
        assert_eq!(switch(&mut scheduler), a);
        assert_eq!(scheduler.state(ThreadId::BOOTSTRAP), Some(ThreadState::Blocked));

        // b exits, waking the bootstrap thread.
        assert_eq!(switch(&mut scheduler), b);
        scheduler.exit_current(22);
        assert_eq!(scheduler.state(ThreadId::BOOTSTRAP), Some(ThreadState::Ready));
        assert!(!queue(&scheduler).contains(&b.as_u64()));

        // Zombies are never downgraded or scheduled.
        let next = switch(&mut scheduler);
        assert_eq!(scheduler.state(b), Some(ThreadState::Zombie));
        assert_ne!(next, b);

        while scheduler.current() != ThreadId::BOOTSTRAP {
            switch(&mut scheduler);
        }

        assert!(!scheduler.block_on(b));
        assert_eq!(scheduler.reap(b), Some(22));
        assert_eq!(scheduler.state(b), None);
        assert_eq!(scheduler.validate_join(b), Err(Error::UnknownThread(b)));
    }

    #[test]
    fn join_validation() {
        let mut scheduler = new_scheduler();
        let a = spawn(&mut scheduler, 1);
        let b = spawn(&mut scheduler, 2);

        assert_eq!(
            scheduler.validate_join(ThreadId::BOOTSTRAP),
            Err(Error::Unjoinable(ThreadId::BOOTSTRAP))
        );
        assert_eq!(
            scheduler.validate_join(ThreadId(99)),
            Err(Error::UnknownThread(ThreadId(99)))
        );

        // a cannot join itself, but can join b.
        assert_eq!(switch(&mut scheduler), ThreadId::BOOTSTRAP);
        assert_eq!(switch(&mut scheduler), a);
        assert_eq!(scheduler.validate_join(a), Err(Error::Unjoinable(a)));
        scheduler.validate_join(b).unwrap();
        assert!(scheduler.block_on(b));

        // A second joiner is rejected without side effects.
        assert_eq!(switch(&mut scheduler), b);
        assert_eq!(switch(&mut scheduler), ThreadId::BOOTSTRAP);
        assert_eq!(scheduler.validate_join(b), Err(Error::AlreadyJoined(b)));
        assert_eq!(scheduler.state(ThreadId::BOOTSTRAP), Some(ThreadState::Running));
        assert_eq!(scheduler.thread(b).unwrap().joiner(), Some(a));
    }

    #[test]
    fn join_cycle() {
        let mut scheduler = new_scheduler();
        let a = spawn(&mut scheduler, 1);
        let b = spawn(&mut scheduler, 2);
        let c = spawn(&mut scheduler, 3);

        // a waits for b, and b waits for c.
        assert_eq!(switch(&mut scheduler), ThreadId::BOOTSTRAP);
        assert_eq!(switch(&mut scheduler), a);
        scheduler.validate_join(b).unwrap();
        assert!(scheduler.block_on(b));
        assert_eq!(switch(&mut scheduler), b);
        scheduler.validate_join(c).unwrap();
        assert!(scheduler.block_on(c));

        // c joining a would close the loop.
        assert_eq!(switch(&mut scheduler), c);
        assert_eq!(scheduler.validate_join(a), Err(Error::Deadlock));
        assert_eq!(scheduler.thread(a).unwrap().joiner(), None);
        assert_eq!(scheduler.state(c), Some(ThreadState::Running));

        // The bootstrap thread can still wait for a.
        assert_eq!(switch(&mut scheduler), ThreadId::BOOTSTRAP);
        scheduler.validate_join(a).unwrap();
    }

    #[test]
    fn stalled_when_nothing_ready() {
        let mut scheduler = new_scheduler();
        let a = spawn(&mut scheduler, 1);

        // The bootstrap thread waits for a, then a is
        // forced to wait for the bootstrap thread.
        assert!(scheduler.block_on(a));
        assert_eq!(switch(&mut scheduler), a);
        assert!(scheduler.block_on(ThreadId::BOOTSTRAP));
        assert!(matches!(scheduler.schedule(), Dispatch::Stalled));
        assert_eq!(scheduler.current(), a);
        assert_eq!(scheduler.state(a), Some(ThreadState::Blocked));

        scheduler.unblock(ThreadId::BOOTSTRAP);
        assert_eq!(scheduler.state(a), Some(ThreadState::Running));
        assert_eq!(scheduler.thread(ThreadId::BOOTSTRAP).unwrap().joiner(), None);
        assert_eq!(scheduler.thread(a).unwrap().joiner(), Some(ThreadId::BOOTSTRAP));
    }

    #[test]
    fn exit_value_zero() {
        let mut scheduler = new_scheduler();
        let a = spawn(&mut scheduler, 0);
        assert_eq!(switch(&mut scheduler), ThreadId::BOOTSTRAP);
        assert_eq!(switch(&mut scheduler), a);
        scheduler.exit_current(0);
        assert!(matches!(scheduler.schedule(), Dispatch::Switch { .. }));
        assert_eq!(scheduler.current(), ThreadId::BOOTSTRAP);
        assert_eq!(scheduler.reap(a), Some(0));
        assert_eq!(scheduler.num_threads(), 1);
    }

    #[test]
    fn reap_running_thread() {
        let mut scheduler = new_scheduler();
        let a = spawn(&mut scheduler, 5);
        assert_eq!(scheduler.reap(a), None);
        assert_eq!(scheduler.state(a), Some(ThreadState::Ready));
        assert_eq!(scheduler.reap(ThreadId(7)), None);
    }

    #[test]
    fn invalid_stack_size() {
        let config = Config::new().stack_size(64);
        assert!(matches!(
            Scheduler::<Recording>::new(config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
