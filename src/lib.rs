//! Single-threaded cooperative scheduling of fiber-backed jobs, with
//! tag-driven blocking, freezing and cancellation.
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate derivative;
#[macro_use]
extern crate failure;

pub mod clock;
pub mod error;
pub mod fiber;
pub mod job;
pub mod scheduler;
pub mod tag;

pub use crate::error::{Exception, Result, SchedulerError};
pub use crate::fiber::FiberAttr;
pub use crate::job::{Job, JobRef, JobState, Work};
pub use crate::scheduler::Scheduler;
pub use crate::tag::Tag;
