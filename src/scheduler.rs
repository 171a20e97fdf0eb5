//! Scheduler
//!
//! The scheduler owns the run queue and drives cycles: once per cycle it
//! samples the clock, merges newly added jobs, injects tag-driven exceptions,
//! and switches into every dispatchable job in FIFO order. Jobs hand the CPU
//! back through their `yield_*` methods; the scheduler and all of its jobs
//! share one logical thread of control, so there is no locking anywhere in
//! the model.
//!
//! Terminating jobs park their self-reference in the scheduler's kill slot
//! ([`take_job_reference`](struct.Scheduler.html#method.take_job_reference)
//! protocol); the slot is cleared right after the switch back, on the
//! scheduler fiber, so a job is never destroyed while its fiber is current.
use std::cell::{Cell, RefCell};
use std::ptr;
use std::rc::Rc;

use log::{debug, error, trace};

use crate::clock::{Clock, MonotonicClock};
use crate::error::{Exception, SchedulerError};
use crate::job::{Job, JobRef, JobState};
use crate::tag;

struct Inner {
    /// Live jobs in FIFO dispatch order.
    jobs: RefCell<Vec<JobRef>>,
    /// Jobs added during the current cycle, merged at the next boundary.
    pending: RefCell<Vec<JobRef>>,
    /// Self-reference of a terminating job, parked until the switch back.
    to_kill: RefCell<Option<JobRef>>,
    /// The job currently executing, None while scheduler code runs.
    current: RefCell<Option<JobRef>>,
    current_time: Cell<u64>,
    cycle: Cell<u64>,
    /// Did the previous cycle contain progress observable by waiting jobs?
    progress: Cell<bool>,
    /// Set when a job terminates during the current cycle.
    terminated: Cell<bool>,
    /// Tag generation sampled at the last cycle boundary.
    tag_generation: Cell<u64>,
    clock: Rc<dyn Clock>,
}

/// Cheaply clonable handle to a scheduler. All clones share the same run
/// queue; every job keeps one.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl Scheduler {
    /// Scheduler over the real monotonic clock.
    pub fn new() -> Self {
        Scheduler::with_clock(Rc::new(MonotonicClock::new()))
    }

    /// Scheduler over an injected clock, usually a
    /// [`ManualClock`](../clock/struct.ManualClock.html).
    pub fn with_clock(clock: Rc<dyn Clock>) -> Self {
        Scheduler {
            inner: Rc::new(Inner {
                jobs: RefCell::new(Vec::new()),
                pending: RefCell::new(Vec::new()),
                to_kill: RefCell::new(None),
                current: RefCell::new(None),
                current_time: Cell::new(clock.now()),
                cycle: Cell::new(0),
                progress: Cell::new(false),
                terminated: Cell::new(false),
                tag_generation: Cell::new(tag::generation()),
                clock,
            }),
        }
    }

    /// Time sampled at the start of the current cycle, microseconds.
    pub fn current_time(&self) -> u64 {
        self.inner.current_time.get()
    }

    /// Monotonically increasing cycle counter.
    pub fn cycle(&self) -> u64 {
        self.inner.cycle.get()
    }

    /// The job currently executing, if scheduler code is not running.
    pub fn current_job(&self) -> Option<JobRef> {
        self.inner.current.borrow().clone()
    }

    /// Live jobs, including ones not yet merged into the run queue.
    pub fn job_count(&self) -> usize {
        self.inner.jobs.borrow().len() + self.inner.pending.borrow().len()
    }

    /// Register a job; it joins the run queue at the next cycle boundary.
    /// Usually called through [`Job::start`](../job/struct.Job.html#method.start).
    pub fn add_job(&self, job: &JobRef) {
        let queued = |j: &JobRef| Rc::ptr_eq(j, job);
        if self.inner.jobs.borrow().iter().any(queued)
            || self.inner.pending.borrow().iter().any(queued)
        {
            panic!("{}", SchedulerError::DoubleStart(job.name().into()));
        }
        debug!("scheduler: job '{}' added", job.name());
        self.inner.pending.borrow_mut().push(job.clone());
    }

    /// Run one cycle. Returns the earliest sleeper deadline when nothing was
    /// dispatchable, so the caller can decide how long to idle.
    pub fn run_cycle(&self) -> Option<u64> {
        let (dispatched, earliest) = self.cycle_inner();
        if dispatched == 0 {
            earliest
        } else {
            None
        }
    }

    /// Run cycles until no job remains, idling on the clock when every job
    /// is asleep. Fatal when the remaining jobs can never run again.
    pub fn run_until_empty(&self) {
        let mut idle_streak = 0;
        while self.job_count() > 0 {
            let (dispatched, earliest) = self.cycle_inner();
            if dispatched > 0 {
                idle_streak = 0;
                continue;
            }
            match earliest {
                Some(deadline) => {
                    idle_streak = 0;
                    self.inner.clock.wait_until(deadline);
                }
                None => {
                    idle_streak += 1;
                    if idle_streak >= 2 {
                        error!(
                            "scheduler: {} jobs left but none can make progress",
                            self.job_count()
                        );
                        panic!("{}", SchedulerError::Deadlock);
                    }
                }
            }
        }
        debug!(
            "scheduler: run queue empty after {} cycles",
            self.inner.cycle.get()
        );
    }

    fn cycle_inner(&self) -> (usize, Option<u64>) {
        let inner = &*self.inner;
        assert!(
            inner.current.borrow().is_none(),
            "run_cycle called from inside a job"
        );

        let now = inner.clock.now();
        inner.current_time.set(now);

        // anything to wake waiting jobs for since the previous cycle?
        let generation = tag::generation();
        let changed = inner.progress.get() || generation != inner.tag_generation.get();
        inner.tag_generation.set(generation);

        // merge jobs added since the last cycle, preserving FIFO order
        {
            let mut jobs = inner.jobs.borrow_mut();
            let mut pending = inner.pending.borrow_mut();
            jobs.extend(pending.drain(..));
        }

        // sweep zombies that survived an earlier cycle
        let mut dead: Vec<JobRef> = Vec::new();
        {
            let mut jobs = inner.jobs.borrow_mut();
            let mut i = 0;
            while i < jobs.len() {
                if jobs[i].terminated() {
                    dead.push(jobs.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        // destroying swept jobs may reenter unschedule_job; no borrow is held
        dead.clear();

        trace!(
            "cycle {}: t={}us, {} jobs, changed={}",
            inner.cycle.get(),
            now,
            inner.jobs.borrow().len(),
            changed
        );

        // build the cycle's ready set
        let mut to_run: Vec<JobRef> = Vec::new();
        let mut earliest: Option<u64> = None;
        {
            let jobs = inner.jobs.borrow();
            for job in jobs.iter() {
                if job.terminated() {
                    continue;
                }
                // tag effects; stop wins over block
                if let Some(depth) = job.stopped_depth() {
                    job.async_throw(Exception::Stopped { depth });
                } else if job.blocked() && !job.non_interruptible() {
                    job.async_throw(Exception::Blocked);
                }
                // frozen jobs stay queued but are not dispatched
                if job.frozen() {
                    job.notice_frozen(now);
                    continue;
                }
                job.notice_not_frozen(now);
                let ready = match job.state() {
                    JobState::ToStart | JobState::Running => true,
                    JobState::Sleeping => {
                        if now >= job.deadline() || job.has_pending_exception() {
                            true
                        } else {
                            let deadline = job.deadline();
                            earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
                            false
                        }
                    }
                    // woken by the target's termination, or to deliver a cancel
                    JobState::Joining => job.has_pending_exception(),
                    JobState::Waiting => changed || job.has_pending_exception(),
                    JobState::Zombie => false,
                };
                if ready {
                    to_run.push(job.clone());
                }
            }
        }

        // dispatch in FIFO order
        let mut dispatched = 0;
        let mut progress = false;
        for job in &to_run {
            if job.terminated() {
                continue;
            }
            trace!("cycle {}: dispatching '{}'", inner.cycle.get(), job.name());
            job.set_state(JobState::Running);
            *inner.current.borrow_mut() = Some(job.clone());
            job.resume_fiber();
            *inner.current.borrow_mut() = None;
            dispatched += 1;
            // drop the parked reference of a terminating job, now that we
            // are back on the scheduler fiber
            let killed = inner.to_kill.borrow_mut().take();
            drop(killed);
            if !job.side_effect_free() {
                progress = true;
            }
            if job.terminated() {
                self.remove_job(job);
            }
        }

        let terminated = inner.terminated.replace(false);
        inner.progress.set(progress || terminated);
        inner.cycle.set(inner.cycle.get() + 1);
        debug_assert!(inner.to_kill.borrow().is_none());
        (dispatched, earliest)
    }

    fn remove_job(&self, job: &JobRef) {
        let removed = {
            let mut jobs = self.inner.jobs.borrow_mut();
            jobs.iter()
                .position(|j| Rc::ptr_eq(j, job))
                .map(|i| jobs.remove(i))
        };
        // destruction may reenter unschedule_job; no borrow is held here
        drop(removed);
    }

    /// Park a terminating job's self-reference. The slot must be empty; it
    /// is cleared on the scheduler fiber right after the switch back.
    pub(crate) fn take_job_reference(&self, myself: JobRef) {
        let mut slot = self.inner.to_kill.borrow_mut();
        if slot.is_some() {
            panic!("{}", SchedulerError::KillSlotBusy);
        }
        trace!("scheduler: staging kill of '{}'", myself.name());
        *slot = Some(myself);
    }

    /// Waiting jobs are woken by terminations as well as by side effects.
    pub(crate) fn note_termination(&self) {
        self.inner.terminated.set(true);
    }

    /// Scrub a destroyed job out of every peer list. Called from the job
    /// destructor; fibers are freed by the destructor afterwards, never here.
    pub(crate) fn unschedule_job(&self, job: &Job) {
        debug_assert!(
            !self
                .inner
                .jobs
                .borrow()
                .iter()
                .chain(self.inner.pending.borrow().iter())
                .any(|j| ptr::eq(&**j, job)),
            "job '{}' destroyed while still scheduled",
            job.name()
        );
        for peer in self.inner.jobs.borrow().iter() {
            peer.scrub_dead_peers();
        }
        for peer in self.inner.pending.borrow().iter() {
            peer.scrub_dead_peers();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::Job;

    #[test]
    fn empty_scheduler_cycles() {
        let clock = Rc::new(ManualClock::new(42));
        let sched = Scheduler::with_clock(clock);
        assert_eq!(sched.job_count(), 0);
        assert_eq!(sched.run_cycle(), None);
        assert_eq!(sched.current_time(), 42);
        assert_eq!(sched.cycle(), 1);
        assert!(sched.current_job().is_none());
    }

    #[test]
    #[should_panic(expected = "started twice")]
    fn double_start_is_fatal() {
        let sched = Scheduler::with_clock(Rc::new(ManualClock::new(0)));
        let job = Job::new(&sched, "once", |_: &Job| Ok(()));
        job.start();
        job.start();
    }

    #[test]
    fn run_until_empty_on_empty_queue_returns() {
        let sched = Scheduler::with_clock(Rc::new(ManualClock::new(0)));
        sched.run_until_empty();
        assert_eq!(sched.cycle(), 0);
    }
}
