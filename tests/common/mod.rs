use std::rc::Rc;

use cosched::clock::ManualClock;
use cosched::Scheduler;

/// Scheduler over a manual clock starting at t=0.
pub fn manual_scheduler() -> (Rc<ManualClock>, Scheduler) {
    let clock = Rc::new(ManualClock::new(0));
    let scheduler = Scheduler::with_clock(clock.clone());
    (clock, scheduler)
}
