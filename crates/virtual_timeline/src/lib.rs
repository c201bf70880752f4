// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A deterministic, single-threaded logical clock for testing time-dependent code.
//!
//! Code that reads the current time, waits and reacts to periodic timers is written against a
//! [`Timeline`]. In tests, waiting does not sleep: the timeline moves its clock by exactly the
//! requested span and delivers every timer tick that falls within it, synchronously and in
//! order. A test that covers an hour of periodic work finishes in microseconds and produces the
//! same sequence of ticks on every run.
//!
//! # Quick Start
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::time::{Duration, SystemTime};
//!
//! use virtual_timeline::{InitialTick, Timeline};
//!
//! let timeline = Timeline::from_system_time(SystemTime::UNIX_EPOCH);
//! let timer = timeline.create_timer(Duration::from_secs(5), InitialTick::Enabled);
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let history = Rc::clone(&seen);
//! let clock = timeline.clone();
//! timer.on_tick(move || {
//!     let elapsed = clock.now().duration_since(SystemTime::UNIX_EPOCH).unwrap();
//!     history.borrow_mut().push(elapsed.as_secs());
//! })?;
//!
//! timeline.wait_for(Duration::from_secs(12));
//!
//! assert_eq!(*seen.borrow(), [0, 5, 10]);
//! # Ok::<(), virtual_timeline::Error>(())
//! ```
//!
//! # Overview
//!
//! - [`Timeline`] - The logical clock. Creates timers, tasks, stopwatches and waiters.
//! - [`Timer`] - Fires its callbacks once per interval boundary crossed by a wait.
//! - [`Task`] - A unit of work that runs in its own branch of logical time.
//! - [`TaskJoin`] - Joins several tasks and collects their errors.
//! - [`Stopwatch`] - Measures logical elapsed time.
//! - [`Waiter`] - Waits following a fixed list of steps.
//! - [`Error`] - Represents an error that can occur when working with a timeline.
//!
//! # Reentrancy
//!
//! Tick callbacks and task actions run synchronously inside the call that triggered them and may
//! call back into the timeline, including waiting themselves. Each tick runs in its own branch of
//! logical time that starts at the tick's instant and only drives the timer that fired it. A
//! given timer fires at a given instant at most once, however many nested waits cross it.
//!
//! # Threading
//!
//! A timeline and everything created from it is confined to the thread that created it. None of
//! the handles implement `Send`.
//!
//! # Logging
//!
//! The crate emits [`tracing`](https://docs.rs/tracing) events for waits, ticks, tasks and
//! aborts. All event names start with `virtual_timeline.`. No subscriber is installed.

mod context;
mod error;
mod ledger;
mod stopwatch;
mod task;
mod timeline;
mod timer;
mod waiter;

pub use error::{AggregateError, Error, Result};
pub use ledger::HandlerId;
pub use stopwatch::Stopwatch;
pub use task::{Task, TaskJoin};
pub use timeline::Timeline;
pub use timer::{InitialTick, Timer};
pub use waiter::Waiter;
