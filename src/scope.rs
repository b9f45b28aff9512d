//! Timescope tree.
//!
//! A timescope is a lexically scoped signal-drive region: closing it reverts
//! every poke it made, either to the value of the nearest enclosing scope
//! that also drives the signal or to the undriven state. Scopes form a
//! forest rooted at a single [`Scope::Root`] node, with one
//! [`Scope::ThreadRoot`] sentinel at the bottom of every stimulus thread's
//! stack. A thread root's parent may live in the *spawning* thread's stack,
//! which is how forked threads inherit the drive state of the scope that
//! created them.
//!
//! Scopes only point parentward, so the structure is an arena of nodes
//! keyed by index — no back-pointers, no reference cycles. A closed scope
//! stays in the arena (descendant threads may still chain through it) and
//! is marked inert via its `closed_step`.

use rustc_hash::FxHashMap;

use crate::actions::PokeRecord;
use crate::signal::{SignalId, SignalValue};
use crate::thread::ThreadId;

/// Index of a scope in the [`ScopeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) usize);

impl ScopeId {
    /// The root scope, parent of every top-level thread.
    pub const ROOT: ScopeId = ScopeId(0);
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// A node in the timescope tree.
#[derive(Debug)]
pub enum Scope {
    /// Singleton parent of all top-level threads. Holds no pokes and has no
    /// owning thread.
    Root,

    /// Sentinel at the bottom of a stimulus thread's scope stack.
    ///
    /// Holds no pokes of its own; drive lookups treat it as transparent and
    /// continue into the spawning scope.
    ThreadRoot {
        /// The thread whose stack bottoms out here.
        thread: ThreadId,
        /// Spawning scope — [`ScopeId::ROOT`] for top-level threads, the
        /// forking thread's innermost timescope otherwise.
        parent: ScopeId,
        /// Timestep at which the thread was created.
        opened_step: u64,
        /// Action id consumed in the spawning scope by the fork, zero for
        /// top-level threads.
        parent_action_id: u64,
    },

    /// A drive scope opened by `new_timescope`.
    Timescope(TimescopeData),
}

/// Mutable state of an open (or closed) timescope.
#[derive(Debug)]
pub struct TimescopeData {
    /// Enclosing scope.
    pub parent: ScopeId,
    /// Owning thread, inherited from the parent chain.
    pub thread: ThreadId,
    /// Timestep at which the scope was opened.
    pub opened_step: u64,
    /// Action id consumed in the parent when this scope was opened.
    pub parent_action_id: u64,
    /// Next action id to hand out inside this scope. Every poke, peek,
    /// child open, and fork consumes one.
    pub next_action_id: u64,
    /// Set when the scope is closed; a closed scope no longer drives.
    pub closed_step: Option<u64>,
    /// Latest poke per signal within this scope.
    pub pokes: FxHashMap<SignalId, PokeRecord>,
}

/// Arena of timescopes. Slot 0 is always [`Scope::Root`].
#[derive(Debug)]
pub struct ScopeArena {
    scopes: Vec<Scope>,
}

impl ScopeArena {
    /// Create an arena holding only the root scope.
    #[must_use]
    pub fn new() -> Self {
        ScopeArena {
            scopes: vec![Scope::Root],
        }
    }

    /// Borrow a scope node.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not produced by this arena. Ids are only minted
    /// by the alloc methods below and the arena never shrinks, so a foreign
    /// id is a bug in the caller.
    #[must_use]
    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    /// Borrow a scope as an open-or-closed timescope, if it is one.
    #[must_use]
    pub fn timescope(&self, id: ScopeId) -> Option<&TimescopeData> {
        match &self.scopes[id.0] {
            Scope::Timescope(data) => Some(data),
            _ => None,
        }
    }

    /// Mutable variant of [`ScopeArena::timescope`].
    pub fn timescope_mut(&mut self, id: ScopeId) -> Option<&mut TimescopeData> {
        match &mut self.scopes[id.0] {
            Scope::Timescope(data) => Some(data),
            _ => None,
        }
    }

    /// Allocate the bottom-of-stack sentinel for a new thread.
    pub fn alloc_thread_root(
        &mut self,
        thread: ThreadId,
        parent: ScopeId,
        opened_step: u64,
        parent_action_id: u64,
    ) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope::ThreadRoot {
            thread,
            parent,
            opened_step,
            parent_action_id,
        });
        id
    }

    /// Allocate a fresh open timescope.
    pub fn alloc_timescope(
        &mut self,
        parent: ScopeId,
        thread: ThreadId,
        opened_step: u64,
        parent_action_id: u64,
    ) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope::Timescope(TimescopeData {
            parent,
            thread,
            opened_step,
            parent_action_id,
            next_action_id: 0,
            closed_step: None,
            pokes: FxHashMap::default(),
        }));
        id
    }

    /// Whether `id` is a timescope that has not been closed.
    #[must_use]
    pub fn is_open(&self, id: ScopeId) -> bool {
        matches!(
            &self.scopes[id.0],
            Scope::Timescope(data) if data.closed_step.is_none()
        )
    }

    /// Owning thread of a scope. `None` for the root.
    #[must_use]
    pub fn owner(&self, id: ScopeId) -> Option<ThreadId> {
        match &self.scopes[id.0] {
            Scope::Root => None,
            Scope::ThreadRoot { thread, .. } => Some(*thread),
            Scope::Timescope(data) => Some(data.thread),
        }
    }

    /// Parent link of a scope. `None` for the root.
    #[must_use]
    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        match &self.scopes[id.0] {
            Scope::Root => None,
            Scope::ThreadRoot { parent, .. } => Some(*parent),
            Scope::Timescope(data) => Some(data.parent),
        }
    }

    /// Whether `ancestor` appears on `scope`'s parent chain, `scope` itself
    /// included. The walk crosses thread roots, so a scope in a spawning
    /// thread is an ancestor of everything in the forked thread.
    #[must_use]
    pub fn chain_contains(&self, scope: ScopeId, ancestor: ScopeId) -> bool {
        let mut cursor = Some(scope);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.parent(id);
        }
        false
    }

    /// Whether `thread` owns any scope on `scope`'s parent chain, `scope`
    /// itself included. This is the spawn-ancestry test used by conflict
    /// checking: a peeking thread may observe pokes made by itself or by
    /// any thread on its spawn chain.
    #[must_use]
    pub fn lineage_contains(&self, scope: ScopeId, thread: ThreadId) -> bool {
        let mut cursor = Some(scope);
        while let Some(id) = cursor {
            if self.owner(id) == Some(thread) {
                return true;
            }
            cursor = self.parent(id);
        }
        false
    }

    /// Value to revert `signal` to when a scope below `from` closes.
    ///
    /// Walks the parent chain starting at `from`: thread roots are
    /// transparent, closed timescopes are skipped (their drive was already
    /// reverted when they closed), and the first open timescope with a poke
    /// on `signal` wins. Reaching the root means no enclosing drive remains
    /// and the signal should be released.
    #[must_use]
    pub fn revert_value(&self, from: ScopeId, signal: SignalId) -> Option<SignalValue> {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            if let Scope::Timescope(data) = &self.scopes[id.0] {
                if data.closed_step.is_none() {
                    if let Some(poke) = data.pokes.get(&signal) {
                        return Some(poke.value);
                    }
                }
            }
            cursor = self.parent(id);
        }
        None
    }
}

impl Default for ScopeArena {
    fn default() -> Self {
        ScopeArena::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::CallSite;

    fn poke(step: u64, action_id: u64, serial: u64, value: u64) -> PokeRecord {
        PokeRecord {
            timestep: step,
            action_id,
            serial,
            value: SignalValue(value),
            site: CallSite::capture(),
        }
    }

    #[test]
    fn test_nearest_ancestor_revert() {
        let mut arena = ScopeArena::new();
        let t0 = ThreadId(0);
        let bottom = arena.alloc_thread_root(t0, ScopeId::ROOT, 0, 0);
        let outer = arena.alloc_timescope(bottom, t0, 0, 0);
        let inner = arena.alloc_timescope(outer, t0, 0, 0);

        let x = SignalId(0);
        arena
            .timescope_mut(outer)
            .unwrap()
            .pokes
            .insert(x, poke(0, 0, 0, 1));
        arena
            .timescope_mut(inner)
            .unwrap()
            .pokes
            .insert(x, poke(0, 0, 1, 2));

        // closing `inner` reverts to the outer poke
        arena.timescope_mut(inner).unwrap().closed_step = Some(0);
        assert_eq!(arena.revert_value(outer, x), Some(SignalValue(1)));

        // closing `outer` releases the drive entirely
        arena.timescope_mut(outer).unwrap().closed_step = Some(0);
        assert_eq!(arena.revert_value(bottom, x), None);
    }

    #[test]
    fn test_thread_root_is_transparent() {
        let mut arena = ScopeArena::new();
        let t0 = ThreadId(0);
        let t1 = ThreadId(1);

        let b0 = arena.alloc_thread_root(t0, ScopeId::ROOT, 0, 0);
        let parent_scope = arena.alloc_timescope(b0, t0, 0, 0);
        let x = SignalId(0);
        arena
            .timescope_mut(parent_scope)
            .unwrap()
            .pokes
            .insert(x, poke(0, 0, 0, 5));

        // forked thread chains through its thread root into the parent scope
        let b1 = arena.alloc_thread_root(t1, parent_scope, 0, 1);
        let child_scope = arena.alloc_timescope(b1, t1, 0, 0);

        assert_eq!(arena.revert_value(b1, x), Some(SignalValue(5)));
        assert!(arena.chain_contains(child_scope, parent_scope));
        assert!(arena.lineage_contains(child_scope, t0));
        assert!(!arena.lineage_contains(parent_scope, t1));
    }

    #[test]
    fn test_closed_ancestor_is_skipped() {
        let mut arena = ScopeArena::new();
        let t0 = ThreadId(0);
        let bottom = arena.alloc_thread_root(t0, ScopeId::ROOT, 0, 0);
        let a = arena.alloc_timescope(bottom, t0, 0, 0);
        let b = arena.alloc_timescope(a, t0, 0, 1);

        let x = SignalId(0);
        arena
            .timescope_mut(a)
            .unwrap()
            .pokes
            .insert(x, poke(0, 0, 0, 1));
        arena
            .timescope_mut(b)
            .unwrap()
            .pokes
            .insert(x, poke(0, 0, 1, 2));
        // b closed: its drive was reverted already, so a's poke wins
        arena.timescope_mut(b).unwrap().closed_step = Some(0);

        assert_eq!(arena.revert_value(b, x), Some(SignalValue(1)));
    }

    #[test]
    fn test_owner_and_parent() {
        let mut arena = ScopeArena::new();
        let t0 = ThreadId(0);
        let bottom = arena.alloc_thread_root(t0, ScopeId::ROOT, 3, 0);
        let scope = arena.alloc_timescope(bottom, t0, 3, 0);

        assert_eq!(arena.owner(ScopeId::ROOT), None);
        assert_eq!(arena.owner(bottom), Some(t0));
        assert_eq!(arena.owner(scope), Some(t0));
        assert_eq!(arena.parent(ScopeId::ROOT), None);
        assert_eq!(arena.parent(bottom), Some(ScopeId::ROOT));
        assert!(arena.is_open(scope));
        assert!(!arena.is_open(bottom));
    }
}
