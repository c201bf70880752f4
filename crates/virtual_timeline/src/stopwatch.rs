// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, SystemTime};

use crate::Timeline;

/// Measures logical time elapsed on a [`Timeline`].
///
/// An instance of `Stopwatch` is created by calling [`Timeline::create_stopwatch()`].
///
/// # Examples
///
/// ```
/// use std::time::{Duration, SystemTime};
///
/// use virtual_timeline::Timeline;
///
/// let timeline = Timeline::from_system_time(SystemTime::UNIX_EPOCH);
/// let stopwatch = timeline.create_stopwatch();
///
/// timeline.wait_for(Duration::from_secs(5));
///
/// assert_eq!(stopwatch.elapsed(), Duration::from_secs(5));
/// ```
#[derive(Debug)]
pub struct Stopwatch {
    timeline: Timeline,
    start: SystemTime,
}

impl Stopwatch {
    pub(crate) fn new(timeline: &Timeline) -> Self {
        Self {
            timeline: timeline.clone(),
            start: timeline.now(),
        }
    }

    /// Returns the logical instant the stopwatch was started at.
    #[must_use]
    pub fn start(&self) -> SystemTime {
        self.start
    }

    /// Returns the logical time elapsed since the stopwatch was started.
    ///
    /// The reading follows the current branch of the timeline. If that branch is behind the
    /// start, for example after a task that created the stopwatch returned, the reading is zero.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.timeline
            .now()
            .duration_since(self.start)
            .unwrap_or_default()
    }
}

impl From<Stopwatch> for Duration {
    fn from(stopwatch: Stopwatch) -> Self {
        stopwatch.elapsed()
    }
}
