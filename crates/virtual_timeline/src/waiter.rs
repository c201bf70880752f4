// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::Cell;
use std::time::Duration;

use crate::{Error, Result, Timeline};

/// Waits on a [`Timeline`] following a fixed list of steps.
///
/// Every call to [`Waiter::wait`] waits for the next step. Code under test that waits in a loop
/// can be given a `Waiter` so that the test decides exactly how far the clock moves on each
/// iteration, and notices when the code waits more often than expected.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, SystemTime};
///
/// use virtual_timeline::Timeline;
///
/// let timeline = Timeline::from_system_time(SystemTime::UNIX_EPOCH);
/// let waiter = timeline.waiter([Duration::from_secs(2), Duration::from_secs(3)]);
///
/// waiter.wait()?;
/// waiter.wait()?;
/// assert_eq!(timeline.now(), SystemTime::UNIX_EPOCH + Duration::from_secs(5));
///
/// assert!(waiter.wait().is_err());
/// # Ok::<(), virtual_timeline::Error>(())
/// ```
#[derive(Debug)]
pub struct Waiter {
    timeline: Timeline,
    steps: Vec<Duration>,
    next: Cell<usize>,
}

impl Waiter {
    pub(crate) fn new(timeline: Timeline, steps: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            timeline,
            steps: steps.into_iter().collect(),
            next: Cell::new(0),
        }
    }

    /// Waits for the next step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] if every step was already used. The clock is not moved.
    pub fn wait(&self) -> Result<()> {
        let index = self.next.get();
        let Some(&span) = self.steps.get(index) else {
            return Err(Error::invalid_operation(format!(
                "more than {} waits were requested",
                self.steps.len()
            )));
        };

        self.next.set(index + 1);
        self.timeline.wait_for(span);
        Ok(())
    }

    /// Returns the number of steps that were not used yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.steps.len() - self.next.get()
    }
}
