use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cosched::{Exception, Job, JobState, Tag};

mod common;
use common::manual_scheduler;

#[test]
fn blocking_a_tag_terminates_an_uncatching_job() {
    let (_clock, sched) = manual_scheduler();
    let tag = Tag::new("guard");

    let job = Job::new(&sched, "loopy", |job: &Job| loop {
        job.yield_now()?;
    });
    job.push_tag(tag.clone());
    job.start();

    sched.run_cycle();
    assert_eq!(job.state(), JobState::Running);

    tag.block();
    sched.run_cycle();
    assert!(job.terminated());
    assert_eq!(job.current_exception(), Some(Exception::Blocked));
    assert_eq!(sched.job_count(), 0);
}

#[test]
fn blocked_job_can_catch_and_unwind_past_the_tag() {
    let (_clock, sched) = manual_scheduler();
    let tag = Tag::new("guard");

    let tag_in = tag.clone();
    let caught = Rc::new(Cell::new(false));
    let caught_in = caught.clone();
    let job = Job::new(&sched, "survivor", move |job: &Job| {
        job.push_tag(tag_in.clone());
        loop {
            match job.yield_now() {
                Ok(()) => {}
                Err(Exception::Blocked) => break,
                Err(e) => return Err(e),
            }
        }
        caught_in.set(true);
        job.pop_tag();
        // no longer under the blocking tag; yielding is clean again
        job.yield_now()?;
        Ok(())
    });
    job.start();

    sched.run_cycle();
    tag.block();
    sched.run_until_empty();

    assert!(caught.get());
    assert!(job.terminated());
    assert_eq!(job.tag_depth(), 0);
}

#[test]
fn stop_unwinds_to_above_the_stopped_tag() {
    let (_clock, sched) = manual_scheduler();
    let t1 = Tag::new("outer");
    let t2 = Tag::new("inner");

    let depth_seen = Rc::new(Cell::new(None));
    let t1_in = t1.clone();
    let t2_in = t2.clone();
    let depth_in = depth_seen.clone();
    let job = Job::new(&sched, "scoped", move |job: &Job| {
        job.push_tag(t1_in.clone());
        job.push_tag(t2_in.clone());
        loop {
            match job.yield_now() {
                Ok(()) => {}
                Err(Exception::Stopped { depth }) => {
                    depth_in.set(Some(depth));
                    while job.tag_depth() > depth {
                        job.pop_tag();
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    });
    job.start();

    sched.run_cycle();
    t1.stop();
    sched.run_until_empty();

    // stopping the outer tag unwinds the inner one as well
    assert_eq!(depth_seen.get(), Some(0));
    assert_eq!(job.tag_depth(), 0);
    assert!(job.terminated());
    assert_eq!(job.current_exception(), Some(Exception::Stopped { depth: 0 }));
}

#[test]
fn pushing_a_stopped_tag_raises_at_the_next_yield() {
    let (_clock, sched) = manual_scheduler();
    let tag = Tag::new("already-stopped");
    tag.stop();

    let seen = Rc::new(RefCell::new(None));
    let tag_in = tag.clone();
    let seen_in = seen.clone();
    let job = Job::new(&sched, "late", move |job: &Job| {
        job.push_tag(tag_in.clone());
        let result = job.yield_now();
        if let Err(e) = &result {
            *seen_in.borrow_mut() = Some(e.clone());
        }
        result
    });
    job.start();
    sched.run_until_empty();

    assert_eq!(*seen.borrow(), Some(Exception::Stopped { depth: 0 }));
    assert!(job.terminated());
}

#[test]
fn stop_is_delivered_despite_non_interruptible() {
    let (_clock, sched) = manual_scheduler();
    let tag = Tag::new("stopper");
    tag.stop();

    let ran = Rc::new(Cell::new(false));
    let ran_in = ran.clone();
    let job = Job::new(&sched, "doomed", move |_: &Job| {
        ran_in.set(true);
        Ok(())
    });
    job.push_tag(tag);
    job.set_non_interruptible(true);
    job.start();
    sched.run_until_empty();

    // the stop exception beat the body to its first instruction
    assert!(!ran.get());
    assert!(job.terminated());
    assert_eq!(job.current_exception(), Some(Exception::Stopped { depth: 0 }));
}

#[test]
fn blocked_is_deferred_while_non_interruptible() {
    let (_clock, sched) = manual_scheduler();
    let tag = Tag::new("guard");
    tag.block();

    let order = Rc::new(RefCell::new(Vec::new()));
    let order_in = order.clone();
    let job = Job::new(&sched, "atomic", move |job: &Job| {
        order_in.borrow_mut().push("ran");
        job.yield_now()?;
        job.yield_now()?;
        order_in.borrow_mut().push("still-running");
        job.set_non_interruptible(false);
        job.yield_now()?;
        order_in.borrow_mut().push("unreachable");
        Ok(())
    });
    job.push_tag(tag);
    job.set_non_interruptible(true);
    job.start();
    sched.run_until_empty();

    // non-interruptible yields are no-ops, so the whole atomic section ran
    // in one slice; the Blocked exception arrived at the first real yield
    assert_eq!(*order.borrow(), vec!["ran", "still-running"]);
    assert!(job.terminated());
    assert_eq!(job.current_exception(), Some(Exception::Blocked));
}

#[test]
fn frozen_job_accumulates_time_shift() {
    let (clock, sched) = manual_scheduler();
    let tag = Tag::new("freezer");

    let shift_seen = Rc::new(Cell::new(0));
    let shift_in = shift_seen.clone();
    let job = Job::new(&sched, "frosty", move |job: &Job| {
        shift_in.set(job.time_shift());
        Ok(())
    });
    job.push_tag(tag.clone());
    tag.freeze();
    job.start();

    for _ in 0..5 {
        sched.run_cycle();
        clock.advance(100_000);
    }
    assert_eq!(job.state(), JobState::ToStart);
    assert_eq!(job.frozen_since(), Some(0));

    tag.unfreeze();
    sched.run_until_empty();

    assert_eq!(shift_seen.get(), 500_000);
    assert_eq!(job.time_shift(), 500_000);
    assert_eq!(job.frozen_since(), None);
    assert!(job.terminated());
}

#[test]
fn freezing_a_parent_freezes_jobs_under_the_child() {
    let (_clock, sched) = manual_scheduler();
    let parent = Tag::new("parent");
    let child = parent.child("child");

    let slices = Rc::new(Cell::new(0));
    let slices_in = slices.clone();
    let job = Job::new(&sched, "nested", move |job: &Job| {
        for _ in 0..2 {
            slices_in.set(slices_in.get() + 1);
            job.yield_now()?;
        }
        Ok(())
    });
    job.push_tag(child);
    parent.freeze();
    job.start();

    sched.run_cycle();
    sched.run_cycle();
    assert_eq!(slices.get(), 0);

    parent.unfreeze();
    sched.run_until_empty();
    assert_eq!(slices.get(), 2);
    assert!(job.terminated());
}

#[test]
fn blocking_a_parent_blocks_jobs_under_the_child() {
    let (_clock, sched) = manual_scheduler();
    let parent = Tag::new("parent");
    let child = parent.child("child");

    let job = Job::new(&sched, "nested", |job: &Job| loop {
        job.yield_now()?;
    });
    job.push_tag(child);
    job.start();

    sched.run_cycle();
    parent.block();
    sched.run_cycle();

    assert!(job.terminated());
    assert_eq!(job.current_exception(), Some(Exception::Blocked));
}

#[test]
fn derived_job_inherits_the_model_tag_stack() {
    let (_clock, sched) = manual_scheduler();
    let tag = Tag::new("shared");

    let model = Job::new(&sched, "model", |job: &Job| loop {
        job.yield_now()?;
    });
    model.push_tag(tag.clone());

    let derived = Job::derive(&model, "derived", |job: &Job| loop {
        job.yield_now()?;
    });
    assert_eq!(derived.tag_depth(), 1);

    model.start();
    derived.start();
    sched.run_cycle();

    // blocking the shared tag takes both jobs down
    tag.block();
    sched.run_cycle();
    assert!(model.terminated());
    assert!(derived.terminated());
}

#[test]
fn waiting_job_wakes_on_tag_mutation() {
    let (_clock, sched) = manual_scheduler();
    let woken = Rc::new(Cell::new(false));

    let woken_in = woken.clone();
    let waiter = Job::new(&sched, "waiter", move |job: &Job| {
        job.set_side_effect_free(true);
        job.yield_until_things_changed()?;
        woken_in.set(true);
        Ok(())
    });
    waiter.start();

    sched.run_cycle();
    assert_eq!(waiter.state(), JobState::Waiting);

    // mutating any tag at all counts as a change
    let unrelated = Tag::new("unrelated");
    unrelated.block();
    sched.run_cycle();
    sched.run_until_empty();
    assert!(woken.get());
    assert!(waiter.terminated());
}
