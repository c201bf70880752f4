// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use jiff::Zoned;
use jiff::tz::{Offset, TimeZone};

use crate::context::{ContextId, ContextStack};
use crate::ledger::{HandlerId, ScheduleKey, ScheduleLedger};
use crate::timer::{TimerCore, crossings};
use crate::{Error, InitialTick, Result, Stopwatch, Task, Timer, Waiter};

/// A logical clock that only moves when told to.
///
/// Code that depends on elapsed time and periodic callbacks calls [`Timeline::now`] and
/// [`Timeline::wait_for`] instead of reading the system clock and sleeping. In tests, waiting
/// is instantaneous bookkeeping: the clock advances by exactly the requested span and every
/// timer interval boundary crossed on the way fires exactly once.
///
/// `Timeline` is a cheap handle; clones refer to the same clock. Timer callbacks and task
/// actions capture clones to call back into the timeline while it is advancing.
///
/// # Logical branches
///
/// The current time is the top of a stack of branches. [`Timeline::create_task`] runs its action
/// inside a new branch that starts at the current instant, so waits inside the action move only
/// the branch. [`Task::join`] later brings the caller's branch up to the instant the task finished.
/// Each timer tick runs inside its own branch that starts at the tick's instant.
///
/// # Examples
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use std::time::{Duration, SystemTime};
///
/// use virtual_timeline::{InitialTick, Timeline};
///
/// let timeline = Timeline::from_system_time(SystemTime::UNIX_EPOCH);
/// let timer = timeline.create_timer(Duration::from_secs(3), InitialTick::Disabled);
///
/// let ticks = Rc::new(Cell::new(0));
/// let counter = Rc::clone(&ticks);
/// timer.on_tick(move || counter.set(counter.get() + 1))?;
///
/// timeline.wait_for(Duration::from_secs(10));
///
/// assert_eq!(ticks.get(), 3);
/// assert_eq!(timeline.now(), SystemTime::UNIX_EPOCH + Duration::from_secs(10));
/// # Ok::<(), virtual_timeline::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Timeline {
    inner: Rc<Inner>,
}

#[derive(Debug)]
struct Inner {
    stack: RefCell<ContextStack>,
    ledger: RefCell<ScheduleLedger>,
    /// Registered timers in registration order.
    timers: RefCell<Vec<Rc<TimerCore>>>,
    last_handler: Cell<u64>,
}

impl Timeline {
    /// Creates a timeline whose clock starts at `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `origin` is not expressed in UTC. Requiring UTC
    /// keeps local and universal instants from being mixed on one timeline.
    ///
    /// # Examples
    ///
    /// ```
    /// use jiff::Timestamp;
    /// use jiff::tz::TimeZone;
    /// use virtual_timeline::Timeline;
    ///
    /// let origin: Timestamp = "2014-01-01T00:00:00Z".parse()?;
    /// let timeline = Timeline::new(&origin.to_zoned(TimeZone::UTC))?;
    ///
    /// assert_eq!(Timestamp::try_from(timeline.now())?, origin);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(origin: &Zoned) -> Result<Self> {
        if !is_utc(origin.time_zone()) {
            return Err(Error::invalid_argument(
                "origin",
                format!("expected an instant in UTC, found offset {}", origin.offset()),
            ));
        }

        Ok(Self::from_system_time(origin.timestamp().into()))
    }

    /// Creates a timeline whose clock starts at `origin`.
    ///
    /// `SystemTime` is absolute, so this constructor cannot fail.
    #[must_use]
    pub fn from_system_time(origin: SystemTime) -> Self {
        Self {
            inner: Rc::new(Inner {
                stack: RefCell::new(ContextStack::new(origin)),
                ledger: RefCell::new(ScheduleLedger::default()),
                timers: RefCell::new(Vec::new()),
                last_handler: Cell::new(0),
            }),
        }
    }

    /// Returns the current logical time.
    #[must_use]
    pub fn now(&self) -> SystemTime {
        self.with_stack(|stack| stack.top().now())
    }

    /// Waits for `span` of logical time.
    ///
    /// The wait happens in three steps:
    ///
    /// 1. Every observing timer whose [`InitialTick::Enabled`] tick is still pending fires it at the
    ///    current instant.
    /// 2. The current branch advances by `span`.
    /// 3. Every observing timer fires once for each interval boundary it crossed, in increasing
    ///    instant order.
    ///
    /// Tick callbacks may call `wait_for` again. A firing that already happened, whether from
    /// this call or from a nested one, is never repeated.
    ///
    /// If the current branch was aborted, the call does nothing.
    pub fn wait_for(&self, span: Duration) {
        let timers = self.inner.timers.borrow().clone();
        for timer in &timers {
            timer.close_subscriptions();
        }

        let (scope, frozen, depth) = self.with_stack(|stack| {
            let top = stack.top();
            (top.scope(), top.is_frozen(), stack.depth())
        });

        if frozen {
            tracing::event!(
                name: "virtual_timeline.wait.frozen",
                tracing::Level::DEBUG,
                wait.span = ?span,
                context.depth = depth,
            );
            return;
        }

        let observers: Vec<_> = timers.into_iter().filter(|timer| scope.observes(timer.id())).collect();

        for timer in &observers {
            timer.on_advancing(self);
        }

        let previous = self.with_stack(|stack| stack.top_mut().advance(span));

        for timer in &observers {
            timer.on_advanced(self, previous, span);
        }

        tracing::event!(
            name: "virtual_timeline.wait",
            tracing::Level::DEBUG,
            wait.span = ?span,
            wait.now = ?self.now(),
            context.depth = depth,
            timers.observing = observers.len(),
        );
    }

    /// Creates a periodic timer that fires every `interval`.
    ///
    /// The timer observes this timeline immediately. Callbacks must be attached with
    /// [`Timer::on_tick`] before the clock is advanced for the first time after the timer was
    /// created. With [`InitialTick::Enabled`], the timer also fires once at the start of the first
    /// advance, in addition to any boundaries that advance crosses.
    ///
    /// An `interval` of zero is raised to one nanosecond.
    #[must_use]
    pub fn create_timer(&self, interval: Duration, initial_tick: InitialTick) -> Timer {
        let core = Rc::new(TimerCore::new(self.next_handler_id(), interval, initial_tick));
        self.inner.timers.borrow_mut().push(Rc::clone(&core));

        Timer::new(self.clone(), core)
    }

    /// Creates a task and runs `action` to completion before returning.
    ///
    /// The action runs in a new branch that starts at the current instant. Waits inside the
    /// action advance only that branch; call [`Task::join`] to bring the caller up to the
    /// instant the action finished. An error returned by the action does not surface here; it is
    /// kept on the task and returned by [`Task::join`].
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::{Duration, SystemTime};
    ///
    /// use virtual_timeline::Timeline;
    ///
    /// let timeline = Timeline::from_system_time(SystemTime::UNIX_EPOCH);
    /// let worker = timeline.clone();
    ///
    /// let task = timeline.create_task(move || {
    ///     worker.wait_for(Duration::from_secs(10));
    ///     Ok(())
    /// });
    ///
    /// // The task ran, but in its own branch.
    /// assert_eq!(timeline.now(), SystemTime::UNIX_EPOCH);
    ///
    /// task.join()?;
    /// assert_eq!(timeline.now(), SystemTime::UNIX_EPOCH + Duration::from_secs(10));
    /// # Ok::<(), virtual_timeline::Error>(())
    /// ```
    #[must_use = "the task's errors are only reported by `Task::join`"]
    pub fn create_task<F>(&self, action: F) -> Task
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let id = self.next_handler_id();
        let parent = self.with_stack(|stack| stack.top().id());
        let guard = self.enter_branch();
        let result = action();
        let (end, remainders) = self.with_stack(|stack| {
            let branch = stack.top();
            (branch.now(), branch.remainders().clone())
        });
        drop(guard);

        tracing::event!(
            name: "virtual_timeline.task",
            tracing::Level::DEBUG,
            task.id = id.get(),
            task.end = ?end,
            task.failed = result.is_err(),
        );

        Task::new(self.clone(), id, parent, end, remainders, result.err())
    }

    /// Creates a stopwatch that measures logical time from the current instant.
    #[must_use]
    pub fn create_stopwatch(&self) -> Stopwatch {
        Stopwatch::new(self)
    }

    /// Creates a [`Waiter`] that waits for `steps[0]`, `steps[1]`, ... on successive calls.
    #[must_use]
    pub fn waiter(&self, steps: impl IntoIterator<Item = Duration>) -> Waiter {
        Waiter::new(self.clone(), steps)
    }

    /// Aborts the current branch.
    ///
    /// Later calls to [`Timeline::wait_for`] on the branch do nothing; time that already elapsed
    /// on it is kept. Code that is running is not interrupted.
    pub fn abort(&self) {
        let depth = self.with_stack(|stack| {
            stack.top_mut().freeze();
            stack.depth()
        });

        tracing::event!(
            name: "virtual_timeline.abort",
            tracing::Level::DEBUG,
            context.depth = depth,
        );
    }

    pub(crate) fn next_handler_id(&self) -> HandlerId {
        let id = self.inner.last_handler.get().wrapping_add(1);
        self.inner.last_handler.set(id);
        HandlerId::new(id)
    }

    /// Runs `body` inside a firing window of the key's handler, unless the ledger shows the
    /// firing already happened.
    ///
    /// Returns `true` if `body` ran.
    pub(crate) fn fire(&self, key: ScheduleKey, body: impl FnOnce()) -> bool {
        if !self.inner.ledger.borrow_mut().insert(key) {
            tracing::event!(
                name: "virtual_timeline.tick.duplicate",
                tracing::Level::TRACE,
                timer.id = key.handler().get(),
            );
            return false;
        }

        let id = self.with_stack(|stack| stack.push_window(key.at(), key.handler()));
        let _guard = ContextGuard { timeline: self, id };

        tracing::event!(
            name: "virtual_timeline.tick",
            tracing::Level::TRACE,
            timer.id = key.handler().get(),
        );

        body();
        true
    }

    /// Brings the current branch forward to `end`. Never rewinds.
    ///
    /// `remainders` are the timer phases of the branch that reached `end`. When the current branch
    /// moves, it takes them over so that its next boundaries stay on each timer's grid. A timer the
    /// other branch never saw keeps its phase shifted by the distance moved.
    pub(crate) fn reconcile(&self, end: SystemTime, remainders: &HashMap<HandlerId, Duration>) {
        let timers = self.inner.timers.borrow().clone();

        self.with_stack(|stack| {
            let top = stack.top_mut();
            let moved = top.advance_to(end);
            if moved.is_zero() {
                return;
            }

            for timer in &timers {
                let remainder = remainders.get(&timer.id()).copied().unwrap_or_else(|| {
                    crossings(top.remainder(timer.id()).saturating_add(moved), timer.interval()).1
                });
                top.set_remainder(timer.id(), remainder);
            }
        });
    }

    /// Freezes the given branch if it is still running.
    pub(crate) fn freeze(&self, context: ContextId) -> bool {
        self.with_stack(|stack| stack.freeze(context))
    }

    pub(crate) fn unregister_timer(&self, id: HandlerId) {
        self.inner.timers.borrow_mut().retain(|timer| timer.id() != id);
    }

    pub(crate) fn with_stack<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ContextStack) -> R,
    {
        f(&mut self.inner.stack.borrow_mut())
    }

    fn enter_branch(&self) -> ContextGuard<'_> {
        let id = self.with_stack(ContextStack::push_branch);
        ContextGuard { timeline: self, id }
    }

    #[cfg(test)]
    pub(crate) fn timers_len(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    #[cfg(test)]
    pub(crate) fn ledger_len(&self) -> usize {
        self.inner.ledger.borrow().len()
    }
}

impl Default for Timeline {
    /// Creates a timeline that starts at the UNIX epoch.
    fn default() -> Self {
        Self::from_system_time(SystemTime::UNIX_EPOCH)
    }
}

/// Pops its branch when dropped, including when a callback unwinds.
struct ContextGuard<'a> {
    timeline: &'a Timeline,
    id: ContextId,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.timeline.with_stack(|stack| stack.pop(self.id));
    }
}

fn is_utc(time_zone: &TimeZone) -> bool {
    matches!(time_zone.iana_name(), Some("UTC" | "Etc/UTC"))
        || time_zone.to_fixed_offset().is_ok_and(|offset| offset == Offset::UTC)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use jiff::Timestamp;
    use jiff::tz;

    use super::*;

    fn origin() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_388_534_400)
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_not_impl_any!(Timeline: Send, Sync);
    }

    #[test]
    fn new_accepts_utc() {
        let zoned = Timestamp::UNIX_EPOCH.to_zoned(TimeZone::UTC);
        let timeline = Timeline::new(&zoned).unwrap();

        assert_eq!(timeline.now(), SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn new_rejects_non_utc() {
        let zoned = Timestamp::UNIX_EPOCH.to_zoned(TimeZone::fixed(tz::offset(9)));
        let error = Timeline::new(&zoned).unwrap_err();

        assert!(matches!(error, Error::InvalidArgument { name: "origin", .. }));
        assert!(error.to_string().starts_with("invalid argument `origin`"));
    }

    #[test]
    fn default_starts_at_epoch() {
        assert_eq!(Timeline::default().now(), SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn wait_for_advances_now() {
        let timeline = Timeline::from_system_time(origin());

        timeline.wait_for(Duration::from_secs(5));
        timeline.wait_for(Duration::ZERO);

        assert_eq!(timeline.now(), origin() + Duration::from_secs(5));
    }

    #[test]
    fn clones_share_the_clock() {
        let timeline = Timeline::from_system_time(origin());
        let clone = timeline.clone();

        clone.wait_for(Duration::from_secs(1));

        assert_eq!(timeline.now(), origin() + Duration::from_secs(1));
    }

    #[test]
    fn abort_freezes_current_branch() {
        let timeline = Timeline::from_system_time(origin());
        timeline.wait_for(Duration::from_secs(1));
        timeline.abort();
        timeline.wait_for(Duration::from_secs(1));

        assert_eq!(timeline.now(), origin() + Duration::from_secs(1));
    }

    #[test]
    fn fire_runs_each_key_once() {
        let timeline = Timeline::from_system_time(origin());
        let handler = timeline.next_handler_id();
        let at = origin() + Duration::from_secs(3);
        let runs = Cell::new(0);

        let body = || {
            assert_eq!(timeline.now(), at);
            runs.set(runs.get() + 1);
        };

        assert!(timeline.fire(ScheduleKey::new(handler, at), body));
        assert!(!timeline.fire(ScheduleKey::new(handler, at), || runs.set(runs.get() + 1)));

        assert_eq!(runs.get(), 1);
        assert_eq!(timeline.ledger_len(), 1);
        assert_eq!(timeline.now(), origin());
        assert_eq!(timeline.with_stack(|stack| stack.depth()), 1);
    }

    #[test]
    fn branch_is_popped_when_action_returns() {
        let timeline = Timeline::from_system_time(origin());
        let inner = timeline.clone();

        let _task = timeline.create_task(move || {
            assert_eq!(inner.with_stack(|stack| stack.depth()), 2);
            Ok(())
        });

        assert_eq!(timeline.with_stack(|stack| stack.depth()), 1);
    }

    #[test]
    fn handler_ids_are_sequential() {
        let timeline = Timeline::default();

        assert_eq!(timeline.next_handler_id().get(), 1);
        assert_eq!(timeline.next_handler_id().get(), 2);
    }

    #[test]
    fn unregister_timer_removes_it() {
        let timeline = Timeline::default();
        let timer = timeline.create_timer(Duration::from_secs(1), InitialTick::Disabled);
        assert_eq!(timeline.timers_len(), 1);

        timeline.unregister_timer(timer.id());
        assert_eq!(timeline.timers_len(), 0);
    }

    #[test]
    fn dispose_breaks_callback_cycle() {
        let timeline = Timeline::from_system_time(origin());
        let timer = timeline.create_timer(Duration::from_secs(1), InitialTick::Disabled);
        let clock = timeline.clone();
        timer.on_tick(move || clock.wait_for(Duration::ZERO)).unwrap();

        let shared = Rc::downgrade(&timeline.inner);
        drop(timeline);
        assert!(shared.upgrade().is_some());

        timer.dispose();
        drop(timer);
        assert!(shared.upgrade().is_none());
    }
}
