//! Tags
//!
//! A tag is a shared, cheaply clonable flag carrier pushed onto a job's tag
//! stack to govern blocking, freezing and stop-scope. Tags form a hierarchy
//! through an optional parent: a tag is effectively blocked/frozen/stopped
//! when it or any ancestor carries the flag.
//!
//! Tags hold no references to jobs. The scheduler polls the tag stacks of
//! live jobs once per cycle, and detects "some tag was mutated" through a
//! global generation counter bumped by every mutation.
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;

bitflags! {
    struct TagFlags: u8 {
        const BLOCKED = 0b001;
        const FROZEN = 0b010;
        const STOPPED = 0b100;
    }
}

/// Bumped on every tag mutation; sampled by the scheduler once per cycle to
/// wake `waiting` jobs.
static GENERATION: AtomicU64 = AtomicU64::new(0);

pub(crate) fn generation() -> u64 {
    GENERATION.load(Ordering::Relaxed)
}

fn note_mutation() {
    GENERATION.fetch_add(1, Ordering::Relaxed);
}

struct TagRecord {
    name: String,
    flags: Cell<TagFlags>,
    parent: Option<Tag>,
}

/// Shared handle to a tag record. Cloning the handle shares the record;
/// equality is record identity.
#[derive(Clone)]
pub struct Tag(Rc<TagRecord>);

impl Tag {
    /// Create a fresh tag with no parent.
    pub fn new(name: impl Into<String>) -> Self {
        Tag(Rc::new(TagRecord {
            name: name.into(),
            flags: Cell::new(TagFlags::empty()),
            parent: None,
        }))
    }

    /// Create a tag whose effective flags include this tag's.
    pub fn child(&self, name: impl Into<String>) -> Self {
        Tag(Rc::new(TagRecord {
            name: name.into(),
            flags: Cell::new(TagFlags::empty()),
            parent: Some(self.clone()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn parent(&self) -> Option<Tag> {
        self.0.parent.clone()
    }

    pub fn block(&self) {
        trace!("tag '{}': block", self.0.name);
        self.set(TagFlags::BLOCKED, true);
    }

    pub fn unblock(&self) {
        trace!("tag '{}': unblock", self.0.name);
        self.set(TagFlags::BLOCKED, false);
    }

    pub fn freeze(&self) {
        trace!("tag '{}': freeze", self.0.name);
        self.set(TagFlags::FROZEN, true);
    }

    pub fn unfreeze(&self) {
        trace!("tag '{}': unfreeze", self.0.name);
        self.set(TagFlags::FROZEN, false);
    }

    /// Mark the tag as stopped. The mark is sticky: every job with this tag
    /// on its stack must unwind the tag's scope.
    pub fn stop(&self) {
        trace!("tag '{}': stop", self.0.name);
        self.set(TagFlags::STOPPED, true);
    }

    /// Is this tag, or any ancestor, blocked?
    pub fn blocked(&self) -> bool {
        self.effective(TagFlags::BLOCKED)
    }

    /// Is this tag, or any ancestor, frozen?
    pub fn frozen(&self) -> bool {
        self.effective(TagFlags::FROZEN)
    }

    /// Is this tag, or any ancestor, stopped?
    pub fn stopped(&self) -> bool {
        self.effective(TagFlags::STOPPED)
    }

    fn set(&self, flag: TagFlags, on: bool) {
        let mut flags = self.0.flags.get();
        flags.set(flag, on);
        self.0.flags.set(flags);
        note_mutation();
    }

    fn effective(&self, flag: TagFlags) -> bool {
        let mut tag = Some(self.clone());
        while let Some(t) = tag {
            if t.0.flags.get().contains(flag) {
                return true;
            }
            tag = t.0.parent.clone();
        }
        false
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Tag {}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Tag")
            .field("name", &self.0.name)
            .field("flags", &self.0.flags.get())
            .field("parent", &self.0.parent.as_ref().map(Tag::name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_toggle() {
        let tag = Tag::new("t");
        assert!(!tag.blocked() && !tag.frozen() && !tag.stopped());
        tag.block();
        assert!(tag.blocked());
        tag.freeze();
        assert!(tag.blocked() && tag.frozen());
        tag.unblock();
        assert!(!tag.blocked() && tag.frozen());
        tag.unfreeze();
        assert!(!tag.frozen());
    }

    #[test]
    fn stop_is_sticky() {
        let tag = Tag::new("t");
        tag.stop();
        assert!(tag.stopped());
    }

    #[test]
    fn effects_union_over_ancestors() {
        let root = Tag::new("root");
        let mid = root.child("mid");
        let leaf = mid.child("leaf");

        root.block();
        assert!(leaf.blocked());
        assert!(mid.blocked());
        root.unblock();
        assert!(!leaf.blocked());

        mid.freeze();
        assert!(leaf.frozen());
        assert!(!root.frozen());

        root.stop();
        assert!(leaf.stopped());
        assert_eq!(leaf.parent().unwrap(), mid);
    }

    #[test]
    fn clones_share_the_record() {
        let tag = Tag::new("t");
        let alias = tag.clone();
        alias.block();
        assert!(tag.blocked());
        assert_eq!(tag, alias);
        assert_ne!(tag, Tag::new("t"));
    }

    #[test]
    fn mutation_bumps_generation() {
        let tag = Tag::new("t");
        let before = generation();
        tag.block();
        assert!(generation() > before);
    }
}
