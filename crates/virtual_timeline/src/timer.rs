// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use crate::ledger::{HandlerId, ScheduleKey};
use crate::{Error, Result, Timeline};

/// The smallest interval a timer can have. Shorter intervals are raised to it.
pub(crate) const MIN_INTERVAL: Duration = Duration::from_nanos(1);

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Whether a timer also fires at the start of the first advance after it is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum InitialTick {
    /// The first tick happens one interval after the timer was created.
    #[default]
    Disabled,

    /// The timer fires once at the start of the first advance, then once per interval.
    Enabled,
}

type Callback = Rc<dyn Fn()>;

/// A periodic timer driven by a [`Timeline`].
///
/// A timer is created by [`Timeline::create_timer`] and observes the timeline from that moment
/// on; there is no separate start step. Every interval boundary that an advance crosses fires
/// the tick callbacks once, at the boundary's logical instant. Tick callbacks may advance the
/// timeline themselves; boundaries they consume are not fired again by the outer advance.
///
/// Dropping a `Timer` handle does not stop the timer. Call [`Timer::dispose`] to stop it.
///
/// The timeline keeps its timers, and a timer keeps its callbacks. A callback that captures a
/// clone of the [`Timeline`] therefore forms a reference cycle: neither the timeline nor the
/// timer is freed until the timer is disposed, which also releases its callbacks.
///
/// # Examples
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use std::time::{Duration, SystemTime};
///
/// use virtual_timeline::{InitialTick, Timeline};
///
/// let timeline = Timeline::from_system_time(SystemTime::UNIX_EPOCH);
/// let timer = timeline.create_timer(Duration::from_secs(5), InitialTick::Enabled);
///
/// let history = Rc::new(RefCell::new(Vec::new()));
/// let record = Rc::clone(&history);
/// let clock = timeline.clone();
/// timer.on_tick(move || record.borrow_mut().push(clock.now()))?;
///
/// timeline.wait_for(Duration::from_secs(12));
///
/// let secs: Vec<u64> = history
///     .borrow()
///     .iter()
///     .map(|at| at.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs())
///     .collect();
/// assert_eq!(secs, [0, 5, 10]);
/// # Ok::<(), virtual_timeline::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Timer {
    timeline: Timeline,
    core: Rc<TimerCore>,
}

impl Timer {
    pub(crate) fn new(timeline: Timeline, core: Rc<TimerCore>) -> Self {
        Self { timeline, core }
    }

    /// Returns the identifier of this timer.
    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.core.id()
    }

    /// Returns the tick interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.core.interval()
    }

    /// Returns the initial tick policy the timer was created with.
    #[must_use]
    pub fn initial_tick(&self) -> InitialTick {
        self.core.initial_tick
    }

    /// Returns `true` until the timer is disposed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.core.is_armed()
    }

    /// Adds a callback that runs on every tick.
    ///
    /// Callbacks run in the order they were added. Inside a callback, [`Timeline::now`] is the
    /// instant of the tick.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] if the timeline has been advanced since the timer was
    /// created. Ticks that happen before a callback is attached would otherwise be silently lost.
    pub fn on_tick(&self, callback: impl Fn() + 'static) -> Result<()> {
        if self.core.subscriptions_closed.get() {
            return Err(Error::invalid_operation(
                "tick callbacks must be added before the timeline is advanced",
            ));
        }

        self.core.callbacks.borrow_mut().push(Rc::new(callback));
        Ok(())
    }

    /// Stops the timer. Ticks that already fired stand.
    ///
    /// Disposing from inside a tick callback is allowed; the remaining ticks of the ongoing
    /// advance are skipped.
    pub fn dispose(&self) {
        if self.core.armed.replace(false) {
            self.timeline.unregister_timer(self.core.id());
            self.core.callbacks.borrow_mut().clear();
        }
    }
}

/// The state a timer shares with the timeline it is registered on.
pub(crate) struct TimerCore {
    id: HandlerId,
    interval: Duration,
    initial_tick: InitialTick,
    initial_tick_consumed: Cell<bool>,
    subscriptions_closed: Cell<bool>,
    armed: Cell<bool>,
    callbacks: RefCell<Vec<Callback>>,
}

impl TimerCore {
    pub fn new(id: HandlerId, interval: Duration, initial_tick: InitialTick) -> Self {
        Self {
            id,
            interval: interval.max(MIN_INTERVAL),
            initial_tick,
            initial_tick_consumed: Cell::new(false),
            subscriptions_closed: Cell::new(false),
            armed: Cell::new(true),
            callbacks: RefCell::new(Vec::new()),
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_armed(&self) -> bool {
        self.armed.get()
    }

    pub fn close_subscriptions(&self) {
        self.subscriptions_closed.set(true);
    }

    /// Fires the pending initial tick, if any, before the timeline adds elapsed time.
    pub fn on_advancing(&self, timeline: &Timeline) {
        if self.initial_tick != InitialTick::Enabled || self.initial_tick_consumed.replace(true) {
            return;
        }

        if self.is_armed() {
            timeline.fire(ScheduleKey::new(self.id, timeline.now()), || self.raise());
        }
    }

    /// Fires once for every boundary crossed by an advance of `span` that started at `previous`.
    ///
    /// The firings are requested in increasing instant order. A firing consumed by a nested
    /// advance is skipped by the ledger; a disposed timer stops firing.
    pub fn on_advanced(&self, timeline: &Timeline, previous: SystemTime, span: Duration) {
        let remainder = timeline.with_stack(|stack| stack.top().remainder(self.id));
        let (total, next_remainder) = crossings(remainder.saturating_add(span), self.interval);

        // The last boundary reached before this advance.
        let mut at = previous.checked_sub(remainder).unwrap_or(previous);

        for _ in 0..total {
            if !self.is_armed() {
                break;
            }

            let Some(next) = at.checked_add(self.interval) else {
                break;
            };

            at = next;
            timeline.fire(ScheduleKey::new(self.id, at), || self.raise());
        }

        timeline.with_stack(|stack| stack.top_mut().set_remainder(self.id, next_remainder));
    }

    fn raise(&self) {
        // Callbacks may add callbacks or dispose the timer; run the ones present now.
        let callbacks = self.callbacks.borrow().clone();

        for callback in callbacks {
            callback();
        }
    }
}

impl fmt::Debug for TimerCore {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerCore")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("initial_tick", &self.initial_tick)
            .field("initial_tick_consumed", &self.initial_tick_consumed.get())
            .field("armed", &self.armed.get())
            .field("callbacks", &self.callbacks.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Splits `carried` into whole intervals and what is left over.
pub(crate) fn crossings(carried: Duration, interval: Duration) -> (u128, Duration) {
    let interval = interval.as_nanos();
    let carried = carried.as_nanos();
    let remainder = carried % interval;

    let secs = u64::try_from(remainder / NANOS_PER_SEC).unwrap_or(u64::MAX);
    let nanos = u32::try_from(remainder % NANOS_PER_SEC).unwrap_or_default();

    (carried / interval, Duration::new(secs, nanos))
}
