//! Fibers
//!
//! A fiber is a suspended flow of control with its own stack: the scheduler
//! switches into it with [`resume()`](struct.Fiber.html#method.resume), the
//! fiber switches back out through the [`Suspend`](struct.Suspend.html)
//! handle passed to its entry, and exactly one side runs at any instant.
//!
//! Each fiber is backed by a parked OS thread and a mutex/condvar baton, so
//! the primitive is portable and needs no per-architecture context switching.
//! The baton discipline keeps the overall model single-threaded cooperative:
//! a switch hands the CPU over and blocks the handing side, so fiber code and
//! scheduler code never run concurrently.
//!
//! Dropping a fiber frees its stack. A finished fiber is joined; a suspended
//! one is unwound first. Freeing the currently running fiber is a fatal
//! caller bug.
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::trace;

use crate::error::SchedulerError;

/// Default fiber stack size in bytes.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest accepted fiber stack.
pub const MIN_STACK_SIZE: usize = 32 * 1024;

/// Which side of the switch owns the CPU.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Owner {
    /// The side that called `resume()` runs; the fiber is parked.
    Parent,
    /// The fiber runs; the resuming side is parked.
    Child,
    /// The fiber is being freed and must unwind its stack.
    Exiting,
    /// The entry function has returned; the thread is gone or going.
    Done,
}

/// Panic payload used to unwind a suspended fiber's stack during teardown.
/// Never surfaces outside the crate.
pub(crate) struct Teardown;

struct Inner {
    owner: Mutex<Owner>,
    cond: Condvar,
    stack_size: usize,
    /// Address of the top of the fiber stack, recorded on first entry.
    stack_base: AtomicUsize,
    /// A panic that escaped the entry function, carried to the resuming side.
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Inner {
    fn stack_remaining(&self) -> usize {
        let base = self.stack_base.load(Ordering::Relaxed);
        if base == 0 {
            return self.stack_size;
        }
        let probe = 0u8;
        let here = &probe as *const u8 as usize;
        self.stack_size.saturating_sub(base.saturating_sub(here))
    }
}

/// Entry closures are moved to the fiber thread but only ever run under the
/// baton, never concurrently with the spawning side.
struct AssertSend<T>(T);

unsafe impl<T> Send for AssertSend<T> {}

/// A stackful fiber. Created suspended; runs its entry between `resume()`
/// and the matching suspend or entry return.
pub struct Fiber {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
    name: String,
}

/// Switch-out handle given to the fiber's entry. Cloning it is cheap; it is
/// only valid on the fiber it was handed to.
#[derive(Clone)]
pub struct Suspend {
    inner: Arc<Inner>,
}

impl Suspend {
    /// Switch out of the fiber, back to whoever called `resume()`. Returns
    /// at the next `resume()`.
    pub fn suspend(&self) {
        let mut owner = self.inner.owner.lock().unwrap();
        debug_assert_eq!(*owner, Owner::Child, "suspend called outside the fiber");
        *owner = Owner::Parent;
        self.inner.cond.notify_all();
        loop {
            match *owner {
                Owner::Child => return,
                Owner::Exiting => {
                    drop(owner);
                    panic::resume_unwind(Box::new(Teardown));
                }
                _ => owner = self.inner.cond.wait(owner).unwrap(),
            }
        }
    }

    /// Approximate bytes of stack left, probed from the current frame.
    pub fn stack_remaining(&self) -> usize {
        self.inner.stack_remaining()
    }
}

impl Fiber {
    /// Create a fiber that will run `f` on its own `stack_size`-byte stack.
    /// The fiber does not start until the first [`resume()`](#method.resume).
    pub fn new<F>(name: &str, stack_size: usize, f: F) -> Self
    where
        F: FnOnce(&Suspend) + 'static,
    {
        let inner = Arc::new(Inner {
            owner: Mutex::new(Owner::Parent),
            cond: Condvar::new(),
            stack_size,
            stack_base: AtomicUsize::new(0),
            panic: Mutex::new(None),
        });
        let thread = {
            let inner = inner.clone();
            let f = AssertSend(f);
            thread::Builder::new()
                .name(name.into())
                .stack_size(stack_size)
                .spawn(move || entry(inner, f))
                .expect("failed to allocate a fiber stack")
        };
        trace!("fiber '{}': created with {} byte stack", name, stack_size);
        Fiber {
            inner,
            thread: Some(thread),
            name: name.into(),
        }
    }

    /// Switch into the fiber. Returns when the fiber suspends or finishes.
    /// A panic that escaped the fiber's entry resumes on the calling side.
    pub fn resume(&self) {
        let mut owner = self.inner.owner.lock().unwrap();
        match *owner {
            Owner::Parent => {}
            Owner::Done => panic!("fiber '{}' resumed after it finished", self.name),
            Owner::Child | Owner::Exiting => {
                panic!("fiber '{}' resumed while it is running", self.name)
            }
        }
        *owner = Owner::Child;
        self.inner.cond.notify_all();
        while *owner == Owner::Child {
            owner = self.inner.cond.wait(owner).unwrap();
        }
        let finished = *owner == Owner::Done;
        drop(owner);
        if finished {
            if let Some(payload) = self.inner.panic.lock().unwrap().take() {
                panic::resume_unwind(payload);
            }
        }
    }

    /// Has the entry function returned?
    pub fn is_finished(&self) -> bool {
        *self.inner.owner.lock().unwrap() == Owner::Done
    }

    pub fn stack_size(&self) -> usize {
        self.inner.stack_size
    }

    /// Approximate bytes of stack left. Only meaningful when called from the
    /// fiber itself; before the first entry the full stack is reported.
    pub fn stack_remaining(&self) -> usize {
        self.inner.stack_remaining()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            {
                let mut owner = self.inner.owner.lock().unwrap();
                match *owner {
                    Owner::Done => {}
                    Owner::Parent => {
                        trace!("fiber '{}': unwinding suspended stack", self.name);
                        *owner = Owner::Exiting;
                        self.inner.cond.notify_all();
                    }
                    Owner::Child | Owner::Exiting => {
                        panic!("fiber '{}' freed while it is running", self.name)
                    }
                }
            }
            let _ = thread.join();
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &self.name)
            .field("stack_size", &self.inner.stack_size)
            .finish()
    }
}

fn entry<F: FnOnce(&Suspend)>(inner: Arc<Inner>, f: AssertSend<F>) {
    {
        let mut owner = inner.owner.lock().unwrap();
        loop {
            match *owner {
                Owner::Child => break,
                Owner::Exiting => {
                    // freed before the first resume; the entry never runs
                    *owner = Owner::Done;
                    inner.cond.notify_all();
                    return;
                }
                _ => owner = inner.cond.wait(owner).unwrap(),
            }
        }
    }
    let probe = 0u8;
    inner
        .stack_base
        .store(&probe as *const u8 as usize, Ordering::Relaxed);
    let suspend = Suspend {
        inner: inner.clone(),
    };
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || (f.0)(&suspend))) {
        if payload.downcast_ref::<Teardown>().is_none() {
            *inner.panic.lock().unwrap() = Some(payload);
        }
    }
    let mut owner = inner.owner.lock().unwrap();
    *owner = Owner::Done;
    inner.cond.notify_all();
}

/// Fiber attributes container, consumed by job construction.
#[derive(Debug, Clone)]
pub struct FiberAttr {
    stack_size: usize,
}

impl FiberAttr {
    /// Attribute container with default parameters.
    pub fn new() -> Self {
        FiberAttr {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Set the stack size for fibers created with this attribute. Sizes below
    /// [`MIN_STACK_SIZE`](constant.MIN_STACK_SIZE.html) are rejected.
    pub fn set_stack_size(&mut self, stack_size: usize) -> Result<(), SchedulerError> {
        if stack_size < MIN_STACK_SIZE {
            return Err(SchedulerError::StackTooSmall(stack_size, MIN_STACK_SIZE));
        }
        self.stack_size = stack_size;
        Ok(())
    }
}

impl Default for FiberAttr {
    fn default() -> Self {
        FiberAttr::new()
    }
}
