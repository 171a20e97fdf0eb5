//! Jobs
//!
//! A [`Job`](struct.Job.html) is a thread of control implemented on top of a
//! [fiber](../fiber/index.html). The scheduler decides which job to launch
//! and resumes its execution; the job hands the CPU back through one of its
//! `yield_*` methods.
//!
//! The lifetime of a job:
//! - construction ([`Job::new`](struct.Job.html#method.new)) allocates the
//!   fiber and parks it;
//! - [`start()`](struct.Job.html#method.start) registers the job with its
//!   scheduler, which will switch into the fiber on the next cycle;
//! - the job's [`Work::work`](trait.Work.html#tymethod.work) body runs,
//!   yielding itself back into the run queue as it goes;
//! - when `work` returns, errors out or panics, the job wakes its joiners,
//!   replicates a propagating exception into its linked peers, hands its
//!   self-reference to the scheduler and becomes a zombie.
//!
//! A fiber must not free its own stack and then switch away, so a job never
//! destroys itself: every job holds one strong reference to itself
//! (`myself`) for its whole live lifetime, and termination *moves* that
//! reference into the scheduler's kill slot. The scheduler drops it after
//! the switch back, on its own fiber, at which point the job is destroyed
//! unless somebody else still holds a handle to it.
//!
//! `links` and join queues are weak relations: they never keep a job alive,
//! and the destructor scrubs stale entries through
//! `Scheduler::unschedule_job`.
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::{Rc, Weak};

use log::{debug, trace, warn};

use crate::error::{Exception, Result, SchedulerError};
use crate::fiber::{Fiber, FiberAttr, Suspend, Teardown, DEFAULT_STACK_SIZE};
use crate::scheduler::Scheduler;
use crate::tag::Tag;

/// Remaining-stack threshold under which
/// [`check_stack_space`](struct.Job.html#method.check_stack_space) raises.
const STACK_HEADROOM: usize = 16 * 1024;

/// Reference-counted handle to a job. Identity is pointer equality.
pub type JobRef = Rc<Job>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Job needs to be started.
    ToStart,
    /// Job is waiting for the CPU.
    Running,
    /// Job is sleeping until a specified deadline.
    Sleeping,
    /// Job is waiting for changes to happen.
    Waiting,
    /// Job is waiting for another job to terminate.
    Joining,
    /// Job wants to be dead but isn't really yet.
    Zombie,
}

/// State name as a static string, for diagnostics.
pub fn state_name(state: JobState) -> &'static str {
    match state {
        JobState::ToStart => "to_start",
        JobState::Running => "running",
        JobState::Sleeping => "sleeping",
        JobState::Waiting => "waiting",
        JobState::Joining => "joining",
        JobState::Zombie => "zombie",
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(state_name(*self))
    }
}

/// A job body.
///
/// `work` does the real work; it runs on the job's fiber and may call the
/// job's `yield_*` methods. Returning `Err` terminates the job and
/// replicates the exception into its linked peers.
///
/// Closures `FnMut(&Job) -> Result<()>` implement `Work`, so most jobs are
/// built straight from a closure.
pub trait Work: 'static {
    fn work(&mut self, job: &Job) -> Result<()>;

    /// Called once when the job dies, prematurely or at its end. Must not
    /// yield; anything it panics with is swallowed.
    fn terminate(&mut self) {}
}

impl<F> Work for F
where
    F: FnMut(&Job) -> Result<()> + 'static,
{
    fn work(&mut self, job: &Job) -> Result<()> {
        self(job)
    }
}

/// One cooperative thread of control: a fiber plus scheduler-visible state.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Job {
    name: String,
    #[derivative(Debug = "ignore")]
    scheduler: Scheduler,
    state: Cell<JobState>,
    /// Only meaningful while the state is `Sleeping`.
    deadline: Cell<u64>,
    /// Time at which the job entered the frozen state, if it is frozen.
    frozen_since: Cell<Option<u64>>,
    /// Value to subtract from scheduler time to get this job's unfrozen time.
    time_shift: Cell<u64>,
    tags: RefCell<Vec<Tag>>,
    /// Jobs that throw whatever exception kills this one, and vice versa.
    links: RefCell<Vec<Weak<Job>>>,
    /// Jobs to wake up when this one terminates.
    to_wake_up: RefCell<Vec<Weak<Job>>>,
    pending_exception: RefCell<Option<Exception>>,
    current_exception: RefCell<Option<Exception>>,
    non_interruptible: Cell<bool>,
    side_effect_free: Cell<bool>,
    /// Myself as long as I have not terminated, None otherwise.
    #[derivative(Debug = "ignore")]
    myself: RefCell<Option<JobRef>>,
    #[derivative(Debug = "ignore")]
    fiber: RefCell<Option<Fiber>>,
    /// Switch-out handle, present while the fiber is entered.
    #[derivative(Debug = "ignore")]
    suspender: RefCell<Option<Suspend>>,
}

impl Job {
    /// Create a job attached to `scheduler`. The job does not run until it
    /// is [started](#method.start).
    pub fn new(scheduler: &Scheduler, name: &str, body: impl Work) -> JobRef {
        Job::construct(
            scheduler.clone(),
            name,
            DEFAULT_STACK_SIZE,
            Vec::new(),
            0,
            Box::new(body),
        )
    }

    /// As [`new()`](#method.new), with fiber attributes.
    pub fn with_attr(
        scheduler: &Scheduler,
        name: &str,
        attr: &FiberAttr,
        body: impl Work,
    ) -> JobRef {
        Job::construct(
            scheduler.clone(),
            name,
            attr.stack_size(),
            Vec::new(),
            0,
            Box::new(body),
        )
    }

    /// Create a job from a model job: same scheduler, a copy of the model's
    /// tag stack and its time shift.
    pub fn derive(model: &Job, name: &str, body: impl Work) -> JobRef {
        let stack_size = model
            .fiber
            .borrow()
            .as_ref()
            .map(Fiber::stack_size)
            .unwrap_or(DEFAULT_STACK_SIZE);
        Job::construct(
            model.scheduler.clone(),
            name,
            stack_size,
            model.tags.borrow().clone(),
            model.time_shift.get(),
            Box::new(body),
        )
    }

    fn construct(
        scheduler: Scheduler,
        name: &str,
        stack_size: usize,
        tags: Vec<Tag>,
        time_shift: u64,
        body: Box<dyn Work>,
    ) -> JobRef {
        let job = Rc::new(Job {
            name: name.into(),
            scheduler,
            state: Cell::new(JobState::ToStart),
            deadline: Cell::new(0),
            frozen_since: Cell::new(None),
            time_shift: Cell::new(time_shift),
            tags: RefCell::new(tags),
            links: RefCell::new(Vec::new()),
            to_wake_up: RefCell::new(Vec::new()),
            pending_exception: RefCell::new(None),
            current_exception: RefCell::new(None),
            non_interruptible: Cell::new(false),
            side_effect_free: Cell::new(false),
            myself: RefCell::new(None),
            fiber: RefCell::new(None),
            suspender: RefCell::new(None),
        });
        *job.myself.borrow_mut() = Some(job.clone());
        let weak = Rc::downgrade(&job);
        let fiber = Fiber::new(name, stack_size, move |suspend: &Suspend| {
            let mut body = body;
            if let Some(job) = weak.upgrade() {
                *job.suspender.borrow_mut() = Some(suspend.clone());
                run(&job, body.as_mut());
                *job.suspender.borrow_mut() = None;
            }
        });
        *job.fiber.borrow_mut() = Some(fiber);
        debug!("job '{}': created", name);
        job
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> JobState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.state.set(state);
    }

    /// Has this job reached the `Zombie` state?
    pub fn terminated(&self) -> bool {
        self.state.get() == JobState::Zombie
    }

    /// This job's scheduler.
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// A strong handle on myself. The job must not be terminated.
    pub fn myself(&self) -> JobRef {
        self.myself
            .borrow()
            .as_ref()
            .expect("job already terminated")
            .clone()
    }

    /// Wake-up date; only meaningful while the state is `Sleeping`.
    pub fn deadline(&self) -> u64 {
        self.deadline.get()
    }

    /// Start the job by adding it to its scheduler. Fatal if called twice.
    pub fn start(&self) {
        if self.state.get() != JobState::ToStart {
            panic!("{}", SchedulerError::DoubleStart(self.name.clone()));
        }
        self.scheduler.add_job(&self.myself());
    }

    // -- Yields ------------------------------------------------------------

    /// Reschedule during the next cycle and hand the CPU back. Does nothing
    /// while the job is non-interruptible.
    pub fn yield_now(&self) -> Result<()> {
        if self.non_interruptible.get() {
            return Ok(());
        }
        self.state.set(JobState::Running);
        self.switch_out();
        self.check_for_pending_exception()
    }

    /// As [`yield_now()`](#method.yield_now), but ask not to be woken before
    /// `deadline` (absolute scheduler time, microseconds).
    pub fn yield_until(&self, deadline: u64) -> Result<()> {
        self.state.set(JobState::Sleeping);
        self.deadline.set(deadline);
        self.switch_out();
        self.check_for_pending_exception()
    }

    /// Wait for `other` to terminate. Returns immediately if it already has.
    pub fn yield_until_terminated(&self, other: &Job) -> Result<()> {
        if other.terminated() {
            return Ok(());
        }
        other.to_wake_up.borrow_mut().push(self.weak_self());
        self.state.set(JobState::Joining);
        self.switch_out();
        self.check_for_pending_exception()
    }

    /// Wait for any other job to make progress: resumed on the next cycle in
    /// which a job with side effects ran, a tag was mutated or a job
    /// terminated.
    pub fn yield_until_things_changed(&self) -> Result<()> {
        self.state.set(JobState::Waiting);
        self.switch_out();
        self.check_for_pending_exception()
    }

    fn switch_out(&self) {
        let suspend = self
            .suspender
            .borrow()
            .clone()
            .expect("yield called outside the job's fiber");
        trace!("job '{}': yielding ({})", self.name, self.state.get());
        suspend.suspend();
    }

    // -- Exceptions --------------------------------------------------------

    /// Ask the job to terminate at its next resume point. The job executes
    /// its cleanup and dies without propagating anything to linked peers.
    pub fn terminate_now(&self) {
        self.async_throw(Exception::Terminated);
    }

    /// Raise `e` inside the job the next time it resumes. A previously
    /// pending exception is discarded.
    pub fn async_throw(&self, e: Exception) {
        if let Some(prev) = self.pending_exception.borrow_mut().replace(e) {
            trace!("job '{}': pending exception '{}' replaced", self.name, prev);
        }
    }

    /// Move a pending exception into the current slot and return it as
    /// `Err`. Called by the job itself right after every yield, and by the
    /// entry wrapper before `work` runs.
    pub fn check_for_pending_exception(&self) -> Result<()> {
        let pending = self.pending_exception.borrow_mut().take();
        match pending {
            Some(e) => {
                trace!("job '{}': delivering {}", self.name, e);
                *self.current_exception.borrow_mut() = Some(e.clone());
                Err(e)
            }
            None => Ok(()),
        }
    }

    pub fn has_pending_exception(&self) -> bool {
        self.pending_exception.borrow().is_some()
    }

    /// The exception being propagated, if any.
    pub fn current_exception(&self) -> Option<Exception> {
        self.current_exception.borrow().clone()
    }

    // -- Links -------------------------------------------------------------

    /// Establish a bi-directional link: if either job dies with an
    /// exception, the other receives it in its pending slot.
    pub fn link(&self, other: &Job) {
        if ptr::eq(self, other) || self.is_linked_to(other) {
            return;
        }
        self.links.borrow_mut().push(other.weak_self());
        other.links.borrow_mut().push(self.weak_self());
    }

    /// Destroy a bi-directional link if it exists.
    pub fn unlink(&self, other: &Job) {
        self.forget_link(other);
        other.forget_link(self);
    }

    fn is_linked_to(&self, other: &Job) -> bool {
        self.links
            .borrow()
            .iter()
            .any(|w| w.upgrade().map_or(false, |j| ptr::eq(&*j, other)))
    }

    fn forget_link(&self, other: &Job) {
        self.links
            .borrow_mut()
            .retain(|w| w.upgrade().map_or(false, |j| !ptr::eq(&*j, other)));
    }

    // -- Tags --------------------------------------------------------------

    /// Push a tag onto the tag stack. Entering an already stopped scope
    /// raises the stop exception at the next yield.
    pub fn push_tag(&self, tag: Tag) {
        if tag.stopped() {
            self.async_throw(Exception::Stopped {
                depth: self.tags.borrow().len(),
            });
        }
        self.tags.borrow_mut().push(tag);
    }

    /// Pop the latest pushed tag. Fatal on an empty stack.
    pub fn pop_tag(&self) -> Tag {
        self.tags.borrow_mut().pop().expect("tag stack is empty")
    }

    /// Replace this job's tag stack with a copy of `other`'s.
    pub fn copy_tags(&self, other: &Job) {
        *self.tags.borrow_mut() = other.tags.borrow().clone();
    }

    pub fn tag_depth(&self) -> usize {
        self.tags.borrow().len()
    }

    /// Is some tag on the stack effectively blocked?
    pub fn blocked(&self) -> bool {
        self.tags.borrow().iter().any(|t| t.blocked())
    }

    /// Is some tag on the stack effectively frozen?
    pub fn frozen(&self) -> bool {
        self.tags.borrow().iter().any(|t| t.frozen())
    }

    /// Index of the topmost effectively stopped tag, which decides the
    /// unwind scope.
    pub(crate) fn stopped_depth(&self) -> Option<usize> {
        self.tags.borrow().iter().rposition(|t| t.stopped())
    }

    // -- Frozen-time accounting --------------------------------------------

    /// Remember when freezing started, if not remembered yet.
    pub(crate) fn notice_frozen(&self, current_time: u64) {
        if self.frozen_since.get().is_none() {
            trace!("job '{}': frozen at {}", self.name, current_time);
            self.frozen_since.set(Some(current_time));
        }
    }

    /// Note that the job is not frozen anymore, folding the frozen window
    /// into the time shift.
    pub(crate) fn notice_not_frozen(&self, current_time: u64) {
        if let Some(since) = self.frozen_since.get() {
            let shift = self.time_shift.get() + (current_time - since);
            trace!("job '{}': unfrozen at {}, shift {}", self.name, current_time, shift);
            self.time_shift.set(shift);
            self.frozen_since.set(None);
        }
    }

    /// Time at which the current frozen window started, if any.
    pub fn frozen_since(&self) -> Option<u64> {
        self.frozen_since.get()
    }

    /// Microseconds to subtract from scheduler time to get this job's
    /// unfrozen time.
    pub fn time_shift(&self) -> u64 {
        self.time_shift.get()
    }

    /// Override the time shift. Should only be used at creation time.
    pub fn set_time_shift(&self, time_shift: u64) {
        self.time_shift.set(time_shift);
    }

    // -- Flags -------------------------------------------------------------

    /// While set, `yield_now` does nothing and the scheduler defers
    /// `Blocked` injection. Stop exceptions are still delivered.
    pub fn set_non_interruptible(&self, ni: bool) {
        self.non_interruptible.set(ni);
    }

    pub fn non_interruptible(&self) -> bool {
        self.non_interruptible.get()
    }

    /// Mark the job as side-effect free: its progress cannot influence other
    /// jobs, so it does not wake `waiting` peers. Defaults to false.
    pub fn set_side_effect_free(&self, free: bool) {
        self.side_effect_free.set(free);
    }

    pub fn side_effect_free(&self) -> bool {
        self.side_effect_free.get()
    }

    // -- Stack -------------------------------------------------------------

    /// Raise if the stack space of this job is near exhaustion. Must be
    /// called from the job itself.
    pub fn check_stack_space(&self) -> Result<()> {
        let remaining = self
            .fiber
            .borrow()
            .as_ref()
            .map(Fiber::stack_remaining)
            .unwrap_or(0);
        if remaining < STACK_HEADROOM {
            Err(Exception::StackExhausted)
        } else {
            Ok(())
        }
    }

    // -- Scheduler plumbing ------------------------------------------------

    pub(crate) fn resume_fiber(&self) {
        let fiber = self.fiber.borrow();
        fiber.as_ref().expect("job has no fiber").resume();
    }

    fn weak_self(&self) -> Weak<Job> {
        Rc::downgrade(self.myself.borrow().as_ref().expect("job already terminated"))
    }

    /// Drop dead weak entries from the peer lists. Called by the scheduler
    /// when some job is destroyed.
    pub(crate) fn scrub_dead_peers(&self) {
        self.links.borrow_mut().retain(|w| w.upgrade().is_some());
        self.to_wake_up
            .borrow_mut()
            .retain(|w| w.upgrade().is_some());
    }

    /// Cleanup run on the job's fiber once `work` is over: wake joiners,
    /// replicate a propagating exception into linked and joining peers,
    /// then hand the self-reference over to the scheduler's kill slot.
    fn terminate_cleanup(&self, error: Option<Exception>) {
        // a requested termination is a clean death; nothing to replicate
        let error = match error {
            Some(Exception::Terminated) => None,
            other => other,
        };
        let joiners = mem::replace(&mut *self.to_wake_up.borrow_mut(), Vec::new());
        for peer in joiners.iter().filter_map(Weak::upgrade) {
            if let Some(e) = &error {
                peer.async_throw(e.clone());
            }
            peer.state.set(JobState::Running);
        }
        let links = mem::replace(&mut *self.links.borrow_mut(), Vec::new());
        for peer in links.iter().filter_map(Weak::upgrade) {
            peer.forget_link(self);
            if let Some(e) = &error {
                peer.async_throw(e.clone());
            }
        }
        // Hand the self-reference to the scheduler: the count stays >= 1, so
        // the fiber cannot be freed while it is still current.
        let myself = self
            .myself
            .borrow_mut()
            .take()
            .expect("job terminated twice");
        self.state.set(JobState::Zombie);
        self.scheduler.take_job_reference(myself);
        self.scheduler.note_termination();
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.state.get())
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        trace!("job '{}': destroyed", self.name);
        self.scheduler.unschedule_job(self);
        // the fiber is freed only after unscheduling
        self.fiber.borrow_mut().take();
    }
}

/// Fiber entry wrapper: deliver a pending exception, run `work`, then the
/// cleanup sequence. Never yields after the cleanup.
fn run(job: &JobRef, body: &mut dyn Work) {
    trace!("job '{}': first dispatch", job.name());
    job.state.set(JobState::Running);
    let result = job.check_for_pending_exception().and_then(|()| {
        match panic::catch_unwind(AssertUnwindSafe(|| body.work(job))) {
            Ok(result) => result,
            Err(payload) => {
                if payload.downcast_ref::<Teardown>().is_some() {
                    panic::resume_unwind(payload);
                }
                warn!("job '{}': work panicked", job.name());
                Err(Exception::user(describe_panic(payload.as_ref())))
            }
        }
    });
    match &result {
        Ok(()) => debug!("job '{}': finished", job.name()),
        Err(e) => debug!("job '{}': terminating with '{}'", job.name(), e),
    }
    if panic::catch_unwind(AssertUnwindSafe(|| body.terminate())).is_err() {
        warn!("job '{}': terminate hook panicked, ignored", job.name());
    }
    job.terminate_cleanup(result.err());
}

fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).into()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(state_name(JobState::ToStart), "to_start");
        assert_eq!(state_name(JobState::Zombie), "zombie");
        assert_eq!(JobState::Sleeping.to_string(), "sleeping");
    }
}
