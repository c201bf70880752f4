// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::ledger::HandlerId;

/// Identifies a single branch of logical time within one timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ContextId(u64);

/// Determines which timers observe advances made while a context is on top of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    /// Every registered timer observes the advance. Used by the root and by task branches.
    All,

    /// Only the given timer observes the advance. Used by timer-firing windows, which
    /// keeps independent timers from driving each other.
    Timer(HandlerId),
}

impl Scope {
    pub fn observes(self, handler: HandlerId) -> bool {
        match self {
            Self::All => true,
            Self::Timer(id) => id == handler,
        }
    }
}

/// A branch of logical time: `now = origin + elapsed`.
///
/// Besides the elapsed time, a context carries the progress of each timer toward
/// its next interval boundary. The progress is branch-local; a nested branch that waits
/// does not disturb the phase its parent will resume with.
#[derive(Debug, Clone)]
pub(crate) struct Context {
    id: ContextId,
    origin: SystemTime,
    elapsed: Duration,
    frozen: bool,
    scope: Scope,
    remainders: HashMap<HandlerId, Duration>,
}

impl Context {
    fn new(id: ContextId, origin: SystemTime, scope: Scope) -> Self {
        Self {
            id,
            origin,
            elapsed: Duration::ZERO,
            frozen: false,
            scope,
            remainders: HashMap::new(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn now(&self) -> SystemTime {
        // Elapsed time only grows through `advance`, which never lets `now` overflow.
        self.origin.checked_add(self.elapsed).unwrap_or(self.origin)
    }

    /// Adds `span` to the elapsed time. A frozen context ignores the request.
    ///
    /// Returns the instant the context was at before the advance.
    pub fn advance(&mut self, span: Duration) -> SystemTime {
        let previous = self.now();

        if self.frozen {
            return previous;
        }

        let elapsed = self.elapsed.saturating_add(span);
        if self.origin.checked_add(elapsed).is_some() {
            self.elapsed = elapsed;
        }

        previous
    }

    /// Moves the context forward so that `now() >= instant`. Never rewinds.
    ///
    /// Returns how far the context actually moved.
    pub fn advance_to(&mut self, instant: SystemTime) -> Duration {
        let before = self.now();
        if let Ok(gap) = instant.duration_since(before) {
            self.advance(gap);
        }

        self.now().duration_since(before).unwrap_or_default()
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn remainder(&self, handler: HandlerId) -> Duration {
        self.remainders.get(&handler).copied().unwrap_or_default()
    }

    pub fn set_remainder(&mut self, handler: HandlerId, remainder: Duration) {
        self.remainders.insert(handler, remainder);
    }

    pub fn remainders(&self) -> &HashMap<HandlerId, Duration> {
        &self.remainders
    }
}

/// The stack of logical branches. Never empty; the top is the current logical time.
#[derive(Debug)]
pub(crate) struct ContextStack {
    contexts: Vec<Context>,
    last_id: u64,
}

impl ContextStack {
    pub fn new(origin: SystemTime) -> Self {
        let root = Context::new(ContextId(0), origin, Scope::All);

        Self {
            contexts: vec![root],
            last_id: 0,
        }
    }

    pub fn top(&self) -> &Context {
        self.contexts.last().expect("the root context is never popped")
    }

    pub fn top_mut(&mut self) -> &mut Context {
        self.contexts.last_mut().expect("the root context is never popped")
    }

    pub fn depth(&self) -> usize {
        self.contexts.len()
    }

    /// Pushes a task branch: same instant, same scope and same timer phases as the current top.
    pub fn push_branch(&mut self) -> ContextId {
        let id = self.next_id();
        let top = self.top();
        let mut branch = Context::new(id, top.now(), top.scope());
        branch.remainders.clone_from(&top.remainders);

        self.push(branch)
    }

    /// Pushes a timer-firing window that starts exactly on one of the timer's boundaries.
    pub fn push_window(&mut self, at: SystemTime, handler: HandlerId) -> ContextId {
        let id = self.next_id();
        self.push(Context::new(id, at, Scope::Timer(handler)))
    }

    /// Pops the context with the given id, which must be the top.
    pub fn pop(&mut self, id: ContextId) -> Option<Context> {
        debug_assert_eq!(self.top().id(), id, "contexts must be popped in LIFO order");

        if self.contexts.len() == 1 || self.top().id() != id {
            return None;
        }

        self.contexts.pop()
    }

    /// Freezes the context with the given id if it is still on the stack.
    pub fn freeze(&mut self, id: ContextId) -> bool {
        match self.contexts.iter_mut().rev().find(|context| context.id() == id) {
            Some(context) => {
                context.freeze();
                true
            }
            None => false,
        }
    }

    fn next_id(&mut self) -> ContextId {
        self.last_id = self.last_id.wrapping_add(1);
        ContextId(self.last_id)
    }

    fn push(&mut self, context: Context) -> ContextId {
        let id = context.id();
        self.contexts.push(context);
        id
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_388_534_400)
    }

    #[test]
    fn now_is_origin_plus_elapsed() {
        let mut stack = ContextStack::new(origin());
        assert_eq!(stack.top().now(), origin());

        let previous = stack.top_mut().advance(Duration::from_secs(5));
        assert_eq!(previous, origin());
        assert_eq!(stack.top().now(), origin() + Duration::from_secs(5));
    }

    #[test]
    fn frozen_context_ignores_advance() {
        let mut stack = ContextStack::new(origin());
        stack.top_mut().advance(Duration::from_secs(60));
        stack.top_mut().freeze();

        stack.top_mut().advance(Duration::from_secs(60));
        assert_eq!(stack.top_mut().advance_to(origin() + Duration::from_secs(600)), Duration::ZERO);

        assert!(stack.top().is_frozen());
        assert_eq!(stack.top().now(), origin() + Duration::from_secs(60));
    }

    #[test]
    fn advance_to_never_rewinds() {
        let mut stack = ContextStack::new(origin());
        stack.top_mut().advance(Duration::from_secs(10));

        let moved = stack.top_mut().advance_to(origin() + Duration::from_secs(3));
        assert_eq!(moved, Duration::ZERO);
        assert_eq!(stack.top().now(), origin() + Duration::from_secs(10));

        let moved = stack.top_mut().advance_to(origin() + Duration::from_secs(20));
        assert_eq!(moved, Duration::from_secs(10));
        assert_eq!(stack.top().now(), origin() + Duration::from_secs(20));
    }

    #[test]
    fn branch_is_independent_of_parent() {
        let mut stack = ContextStack::new(origin());
        let handler = HandlerId::new(7);
        stack.top_mut().set_remainder(handler, Duration::from_secs(2));

        let branch = stack.push_branch();
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.top().scope(), Scope::All);
        assert_eq!(stack.top().remainder(handler), Duration::from_secs(2));

        stack.top_mut().advance(Duration::from_secs(30));
        stack.top_mut().set_remainder(handler, Duration::from_secs(1));
        let popped = stack.pop(branch).unwrap();

        assert_eq!(popped.now(), origin() + Duration::from_secs(30));
        assert_eq!(stack.top().now(), origin());
        assert_eq!(stack.top().remainder(handler), Duration::from_secs(2));
    }

    #[test]
    fn window_is_scoped_to_its_timer() {
        let mut stack = ContextStack::new(origin());
        let handler = HandlerId::new(1);
        let at = origin() + Duration::from_secs(3);

        let window = stack.push_window(at, handler);
        assert_eq!(stack.top().now(), at);
        assert!(stack.top().scope().observes(handler));
        assert!(!stack.top().scope().observes(HandlerId::new(2)));
        assert_eq!(stack.top().remainder(handler), Duration::ZERO);

        // A task started inside the window keeps the window's scope.
        let branch = stack.push_branch();
        assert_eq!(stack.top().scope(), Scope::Timer(handler));

        stack.pop(branch).unwrap();
        stack.pop(window).unwrap();
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn root_is_never_popped() {
        let mut stack = ContextStack::new(origin());
        let root = stack.top().id();

        assert!(stack.pop(root).is_none());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn freeze_finds_context_by_id() {
        let mut stack = ContextStack::new(origin());
        let branch = stack.push_branch();
        let inner = stack.push_branch();

        assert!(stack.freeze(branch));
        assert!(!stack.top().is_frozen());

        stack.pop(inner).unwrap();
        assert!(stack.top().is_frozen());

        stack.pop(branch).unwrap();
        assert!(!stack.freeze(branch));
        assert!(!stack.top().is_frozen());
    }
}
