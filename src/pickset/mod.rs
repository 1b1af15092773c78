//! A generic set with membership, temporary/permanent blocking of elements,
//! and a stateful round-robin picker that skips blocked elements.
//!
//! The set keeps three collaborating stores, per spec §3: an ordered
//! sequence (a doubly linked list over an arena of nodes, giving insertion
//! order and O(1) unlink), a mapping from element to node id (O(1)
//! membership/removal), and a blocked subset. See [`PickableSet`] and
//! [`Picker`].

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::sleep;

use crate::error::PickError;

type NodeId = u64;

struct Node<T> {
    value: T,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

struct Inner<T> {
    nodes: HashMap<NodeId, Node<T>>,
    index: HashMap<T, NodeId>,
    blocked: HashSet<T>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    next_id: NodeId,
}

impl<T: Eq + Hash + Clone> Inner<T> {
    fn new() -> Self {
        Inner {
            nodes: HashMap::new(),
            index: HashMap::new(),
            blocked: HashSet::new(),
            head: None,
            tail: None,
            next_id: 0,
        }
    }

    fn is_consistent(&self) -> bool {
        self.head.is_none() == self.tail.is_none()
    }

    /// Candidate to try first in a sweep, given the picker's last pick.
    fn next_candidate(&self, prev: Option<NodeId>) -> Option<NodeId> {
        match prev {
            None => self.head,
            Some(id) => match self.nodes.get(&id) {
                Some(node) => node.next.or(self.head),
                // prevPick is dangling (removed since); reset so the walk
                // starts at the head, per spec §4.A step 3.
                None => self.head,
            },
        }
    }
}

/// An ordered, hashable-element set supporting block/unblock and a
/// round-robin [`Picker`] (spec §3, §4.A).
pub struct PickableSet<T: Eq + Hash + Clone> {
    inner: Arc<RwLock<Inner<T>>>,
}

impl<T: Eq + Hash + Clone> Clone for PickableSet<T> {
    fn clone(&self) -> Self {
        PickableSet {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Eq + Hash + Clone> Default for PickableSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PickableSet<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Creates an empty set.
    pub fn new() -> Self {
        PickableSet {
            inner: Arc::new(RwLock::new(Inner::new())),
        }
    }

    /// Inserts `x` at the tail of the ordered sequence. Returns `false` if
    /// already present.
    pub fn add(&self, x: T) -> bool {
        let mut inner = self.inner.write();
        if inner.index.contains_key(&x) {
            return false;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let old_tail = inner.tail;
        inner.nodes.insert(
            id,
            Node {
                value: x.clone(),
                prev: old_tail,
                next: None,
            },
        );
        if let Some(tail_id) = old_tail {
            inner.nodes.get_mut(&tail_id).unwrap().next = Some(id);
        } else {
            inner.head = Some(id);
        }
        inner.tail = Some(id);
        inner.index.insert(x, id);
        true
    }

    /// Removes `x` from the mapping, ordered sequence, and blocked subset.
    /// Returns `false` if absent.
    pub fn remove(&self, x: &T) -> bool {
        let mut inner = self.inner.write();
        let Some(id) = inner.index.remove(x) else {
            return false;
        };
        inner.blocked.remove(x);
        let node = inner.nodes.remove(&id).expect("index/node desync");
        match node.prev {
            Some(prev_id) => inner.nodes.get_mut(&prev_id).unwrap().next = node.next,
            None => inner.head = node.next,
        }
        match node.next {
            Some(next_id) => inner.nodes.get_mut(&next_id).unwrap().prev = node.prev,
            None => inner.tail = node.prev,
        }
        true
    }

    /// Whether `x` is a member (blocked or not).
    pub fn has(&self, x: &T) -> bool {
        self.inner.read().index.contains_key(x)
    }

    /// Whether `x` is a member and not currently blocked.
    pub fn has_unblocked(&self, x: &T) -> bool {
        let inner = self.inner.read();
        inner.index.contains_key(x) && !inner.blocked.contains(x)
    }

    /// Whether `x` is currently blocked. `false` if absent.
    pub fn is_blocked(&self, x: &T) -> bool {
        self.inner.read().blocked.contains(x)
    }

    /// Number of members (blocked and unblocked).
    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds `x` to the blocked subset. Returns `false` if absent or already
    /// blocked.
    pub fn block(&self, x: &T) -> bool {
        let mut inner = self.inner.write();
        if !inner.index.contains_key(x) || inner.blocked.contains(x) {
            return false;
        }
        inner.blocked.insert(x.clone());
        true
    }

    /// Removes `x` from the blocked subset. Returns `false` if absent or not
    /// blocked.
    pub fn unblock(&self, x: &T) -> bool {
        let mut inner = self.inner.write();
        if !inner.blocked.contains(x) {
            return false;
        }
        inner.blocked.remove(x);
        true
    }

    /// Atomically blocks `x` and schedules a fire-and-forget unblock after
    /// `d`. Returns `false` if already blocked (no scheduling occurs); the
    /// scheduled unblock is a no-op if `x` was removed or already unblocked
    /// by the time it fires.
    pub fn block_for_duration(&self, x: &T, d: Duration) -> bool {
        if !self.block(x) {
            return false;
        }
        let set = self.clone();
        let target = x.clone();
        tokio::spawn(async move {
            sleep(d).await;
            set.unblock(&target);
        });
        true
    }

    /// A round-robin picker over unblocked elements that wraps forever.
    pub fn picker(&self) -> Picker<T> {
        Picker::new(self.clone(), Mode::SkipBlocked, false)
    }

    /// A round-robin picker over all elements (ignoring blocks) that wraps
    /// forever.
    pub fn all_picker(&self) -> Picker<T> {
        Picker::new(self.clone(), Mode::IncludeAll, false)
    }

    /// A round-robin picker over unblocked elements that signals
    /// [`PickError::ArrivedEnd`] after one full sweep instead of wrapping.
    pub fn picker_no_repeat(&self) -> Picker<T> {
        Picker::new(self.clone(), Mode::SkipBlocked, true)
    }

    /// A round-robin picker over all elements (ignoring blocks) that signals
    /// [`PickError::ArrivedEnd`] after one full sweep.
    pub fn all_picker_no_repeat(&self) -> Picker<T> {
        Picker::new(self.clone(), Mode::IncludeAll, true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    SkipBlocked,
    IncludeAll,
}

struct CursorState {
    prev_pick: Option<NodeId>,
    /// No-repeat pickers only: the candidate a sweep started at, fixed on
    /// that sweep's first `pick()` call. Once a later call's starting
    /// candidate arrives back at this node, the sweep is over and `pick`
    /// returns `ArrivedEnd` instead of wrapping around again.
    sweep_anchor: Option<NodeId>,
}

/// A stateful cursor into a [`PickableSet`] (spec §3, §4.A).
///
/// Cloning a `Picker` shares its cursor: all clones advance the same
/// round-robin state, which is how a single rule's picker can be handed to
/// many concurrent accept-loop callers.
pub struct Picker<T: Eq + Hash + Clone> {
    set: PickableSet<T>,
    cursor: Arc<Mutex<CursorState>>,
    mode: Mode,
    no_repeat: bool,
}

impl<T: Eq + Hash + Clone> Clone for Picker<T> {
    fn clone(&self) -> Self {
        Picker {
            set: self.set.clone(),
            cursor: self.cursor.clone(),
            mode: self.mode,
            no_repeat: self.no_repeat,
        }
    }
}

impl<T> Picker<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn new(set: PickableSet<T>, mode: Mode, no_repeat: bool) -> Self {
        Picker {
            set,
            cursor: Arc::new(Mutex::new(CursorState {
                prev_pick: None,
                sweep_anchor: None,
            })),
            mode,
            no_repeat,
        }
    }

    /// Advances the cursor and returns the next element per spec §4.A's
    /// Pick algorithm.
    pub fn pick(&self) -> Result<T, PickError> {
        let inner = self.set.inner.read();

        if inner.index.is_empty() {
            return Err(PickError::SetEmpty);
        }
        if !inner.is_consistent() {
            return Err(PickError::ListInvalid);
        }
        if self.mode == Mode::SkipBlocked && inner.blocked.len() == inner.index.len() {
            return Err(PickError::NoneAvailable);
        }

        let mut cursor = self.cursor.lock();
        let Some(start_id) = inner.next_candidate(cursor.prev_pick) else {
            return Err(PickError::ListEmpty);
        };

        if self.no_repeat {
            match cursor.sweep_anchor {
                // First pick of a fresh sweep: fix the anchor here, so a
                // later call arriving back at this exact candidate knows
                // the sweep has gone all the way around.
                None => cursor.sweep_anchor = Some(start_id),
                Some(anchor) if anchor == start_id => return Err(PickError::ArrivedEnd),
                Some(_) => {}
            }
        }

        let max_iterations = inner.index.len() * 3;
        let mut current = start_id;
        let mut steps = 0usize;
        loop {
            let node = inner.nodes.get(&current).expect("node/index desync");
            let satisfies = match self.mode {
                Mode::IncludeAll => true,
                Mode::SkipBlocked => !inner.blocked.contains(&node.value),
            };
            if satisfies {
                cursor.prev_pick = Some(current);
                return Ok(node.value.clone());
            }

            let next = node.next.or(inner.head).expect("non-empty set has a head");
            steps += 1;
            if self.no_repeat {
                if let Some(anchor) = cursor.sweep_anchor {
                    if next == anchor {
                        // Wrapped all the way back to where this sweep
                        // started without finding another match.
                        return Err(PickError::ArrivedEnd);
                    }
                }
            } else if steps >= max_iterations {
                return Err(PickError::MaxIteration);
            }
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn set_abcde() -> PickableSet<&'static str> {
        let s = PickableSet::new();
        for x in ["a", "b", "c", "d", "e"] {
            s.add(x);
        }
        s
    }

    #[test]
    fn s1_picker_round_robin_skips_blocked() {
        let s = set_abcde();
        s.block(&"c");
        s.block(&"d");
        let p = s.picker();
        let expected = ["a", "b", "e"].repeat(3);
        for want in expected {
            assert_eq!(p.pick().unwrap(), want);
        }
    }

    #[test]
    fn s3_all_picker_ignores_blocks() {
        let s = set_abcde();
        s.block(&"c");
        s.block(&"d");
        let p = s.all_picker();
        let expected = ["a", "b", "c", "d", "e"].repeat(2);
        for want in expected {
            assert_eq!(p.pick().unwrap(), want);
        }
    }

    #[tokio::test]
    async fn s2_block_for_duration() {
        let s = PickableSet::new();
        s.add("e");
        s.block_for_duration(&"e", Duration::from_millis(200));
        assert!(s.is_blocked(&"e"));
        // A second call while already blocked must not reschedule.
        assert!(!s.block_for_duration(&"e", Duration::from_millis(100)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!s.is_blocked(&"e"));
    }

    #[test]
    fn all_members_blocked_yields_none_available() {
        let s = PickableSet::new();
        s.add("a");
        s.block(&"a");
        assert_eq!(s.picker().pick().unwrap_err(), PickError::NoneAvailable);
    }

    #[test]
    fn empty_set_yields_set_empty() {
        let s: PickableSet<&str> = PickableSet::new();
        assert_eq!(s.picker().pick().unwrap_err(), PickError::SetEmpty);
    }

    #[test]
    fn no_repeat_picker_signals_arrived_end() {
        let s = set_abcde();
        let p = s.picker_no_repeat();
        for want in ["a", "b", "c", "d", "e"] {
            assert_eq!(p.pick().unwrap(), want);
        }
        assert_eq!(p.pick().unwrap_err(), PickError::ArrivedEnd);
    }

    /// Regression test for a busy loop: a caller that calls `pick()` on an
    /// `all_picker_no_repeat()` in a tight loop (as `healthset`'s prober
    /// sweep does) must see `ArrivedEnd` within one lap of the set, not spin
    /// forever. Run on a multi-thread runtime with a real (unpaused) wall
    /// clock, so a regression that makes the loop genuinely non-terminating
    /// starves this test's own task instead of silently passing.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn all_picker_no_repeat_reaches_arrived_end() {
        let outcome = tokio::time::timeout(Duration::from_secs(5), async {
            let s = set_abcde();
            s.block(&"c");
            s.block(&"d");
            let p = s.all_picker_no_repeat();
            let mut seen = Vec::new();
            loop {
                match p.pick() {
                    Ok(v) => seen.push(v),
                    Err(e) => return (seen, e),
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("all_picker_no_repeat never reached ArrivedEnd");

        let (seen, err) = outcome;
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(err, PickError::ArrivedEnd);
    }

    #[test]
    fn removed_prev_pick_resets_to_head() {
        let s = set_abcde();
        let p = s.picker();
        assert_eq!(p.pick().unwrap(), "a");
        s.remove(&"b");
        // prevPick ('a') is still present, so this just continues normally
        // to whichever element follows 'a' now that 'b' is gone.
        assert_eq!(p.pick().unwrap(), "c");
    }

    #[test]
    fn new_target_enters_rotation_at_tail() {
        let s = PickableSet::new();
        s.add("a");
        s.add("b");
        let p = s.picker();
        assert_eq!(p.pick().unwrap(), "a");
        s.add("c");
        assert_eq!(p.pick().unwrap(), "b");
        assert_eq!(p.pick().unwrap(), "c");
        assert_eq!(p.pick().unwrap(), "a");
    }

    #[test]
    fn membership_queries() {
        let s = PickableSet::new();
        assert!(s.add("a"));
        assert!(!s.add("a"));
        assert!(s.has(&"a"));
        assert!(s.has_unblocked(&"a"));
        assert!(s.block(&"a"));
        assert!(!s.block(&"a"));
        assert!(!s.has_unblocked(&"a"));
        assert!(s.is_blocked(&"a"));
        assert!(s.unblock(&"a"));
        assert!(!s.unblock(&"a"));
        assert_eq!(s.len(), 1);
        assert!(s.remove(&"a"));
        assert!(!s.remove(&"a"));
        assert_eq!(s.len(), 0);
    }
}
