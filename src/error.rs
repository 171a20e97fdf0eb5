use std::result;

/// Exceptions delivered to jobs through the pending-exception slot.
///
/// These are normal control flow, not invariant violations: the scheduler
/// injects them ([`Blocked`](#variant.Blocked), [`Stopped`](#variant.Stopped))
/// and jobs either catch them inside `work()` or die and replicate them into
/// their linked peers.
#[derive(Debug, Clone, PartialEq, Fail)]
pub enum Exception {
    /// A tag on the job's stack is blocked. The job must unwind until it is
    /// above the blocking tag or die.
    #[fail(display = "job is blocked by a tag")]
    Blocked,

    /// A tag on the job's stack was stopped. `depth` is the index of the
    /// stopped tag in the stack; handlers pop tags while the stack is deeper
    /// than `depth`.
    #[fail(display = "job was stopped by a tag at depth {}", depth)]
    Stopped { depth: usize },

    /// The job was asked to terminate. Unlike every other exception it is
    /// not replicated into linked peers when it kills its job.
    #[fail(display = "job termination requested")]
    Terminated,

    /// The fiber's remaining stack dropped under the safety headroom.
    #[fail(display = "fiber stack space exhausted")]
    StackExhausted,

    /// An application-defined error raised from a job body.
    #[fail(display = "{}", _0)]
    UserError(String),
}

impl Exception {
    /// Shortcut for raising an application-defined error.
    pub fn user(message: impl Into<String>) -> Self {
        Exception::UserError(message.into())
    }
}

/// Scheduler invariant violations. These are fatal: they are returned from
/// configuration APIs or formatted into panics, never delivered to jobs.
#[derive(Debug, Fail)]
pub enum SchedulerError {
    #[fail(display = "job '{}' was started twice", _0)]
    DoubleStart(String),

    #[fail(display = "kill slot is already staged with a terminating job")]
    KillSlotBusy,

    #[fail(display = "no job can make progress and no deadline to wait for")]
    Deadlock,

    #[fail(display = "fiber stack size {} is below the minimum of {}", _0, _1)]
    StackTooSmall(usize, usize),
}

pub type Result<T> = result::Result<T, Exception>;
