// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::context::ContextId;
use crate::ledger::HandlerId;
use crate::{AggregateError, Error, Result, Timeline};

/// A unit of logical work created by [`Timeline::create_task`].
///
/// The action has already run to completion when the task is returned; there is no start step
/// and no background execution. The task remembers the logical instant the action finished at
/// and the error it returned, if any. Both are handed back to the caller by [`Task::join`].
///
/// A task is bound to the branch of logical time that created it. [`Task::join`] brings that
/// branch forward and [`Task::abort`] freezes it.
///
/// # Examples
///
/// ```
/// use std::time::SystemTime;
///
/// use virtual_timeline::Timeline;
///
/// let timeline = Timeline::from_system_time(SystemTime::UNIX_EPOCH);
///
/// let task = timeline.create_task(|| anyhow::bail!("oops"));
///
/// // The failure surfaces only when the task is joined.
/// let error = task.join().unwrap_err();
/// assert_eq!(error.as_aggregate().unwrap().errors()[0].to_string(), "oops");
/// ```
#[derive(Debug)]
pub struct Task {
    timeline: Timeline,
    id: HandlerId,
    /// The branch that created the task.
    context: ContextId,
    end: SystemTime,
    /// Timer phases of the task's own branch at `end`.
    remainders: HashMap<HandlerId, Duration>,
    errors: Vec<anyhow::Error>,
}

impl Task {
    pub(crate) fn new(
        timeline: Timeline,
        id: HandlerId,
        context: ContextId,
        end: SystemTime,
        remainders: HashMap<HandlerId, Duration>,
        error: Option<anyhow::Error>,
    ) -> Self {
        Self {
            timeline,
            id,
            context,
            end,
            remainders,
            errors: error.map(flatten).unwrap_or_default(),
        }
    }

    /// Returns the identifier of this task.
    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Returns the logical instant the action finished at.
    #[must_use]
    pub fn end_instant(&self) -> SystemTime {
        self.end
    }

    /// Returns `true` if the action returned an error.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Waits for the task.
    ///
    /// The current branch of the timeline is first brought forward to the instant the task
    /// finished at; it never moves backwards. Timers keep their phase across the jump, so the
    /// next tick after the join lands on the same boundary it would have without the task. Then,
    /// if the action failed, its error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aggregate`] holding the action's error if the action failed.
    pub fn join(self) -> Result<()> {
        self.timeline.reconcile(self.end, &self.remainders);

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError::new(self.errors).into())
        }
    }

    /// Aborts the branch the task is bound to.
    ///
    /// Later waits on that branch do nothing, and neither does joining a task on it. Time that
    /// already elapsed on the branch is kept. If the branch has already ended, for example
    /// because the task was created inside another task's action, nothing happens.
    pub fn abort(&self) {
        let frozen = self.timeline.freeze(self.context);

        tracing::event!(
            name: "virtual_timeline.task.abort",
            tracing::Level::DEBUG,
            task.id = self.id.get(),
            task.frozen = frozen,
        );
    }

    /// Releases the task without joining it.
    ///
    /// The caller's branch is not brought forward and any error of the action is discarded.
    pub fn dispose(self) {
        drop(self);
    }
}

/// Joins several tasks at once.
///
/// # Examples
///
/// ```
/// use std::time::SystemTime;
///
/// use virtual_timeline::{TaskJoin, Timeline};
///
/// let timeline = Timeline::from_system_time(SystemTime::UNIX_EPOCH);
///
/// let first = timeline.create_task(|| anyhow::bail!("first"));
/// let second = timeline.create_task(|| Ok(()));
/// let third = timeline.create_task(|| anyhow::bail!("third"));
///
/// let error = TaskJoin::new().join_all([first, second, third]).unwrap_err();
/// let messages: Vec<String> = error
///     .as_aggregate()
///     .unwrap()
///     .iter()
///     .map(ToString::to_string)
///     .collect();
///
/// assert_eq!(messages, ["first", "third"]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct TaskJoin;

impl TaskJoin {
    /// Creates a new `TaskJoin`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Joins every task, in order.
    ///
    /// A failing join does not stop the remaining tasks from being joined. Once all of them
    /// have been joined, the errors of all failed tasks are returned together.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aggregate`] holding every error, in task order, if any task failed.
    #[expect(clippy::unused_self, reason = "for future expansion")]
    pub fn join_all(&self, tasks: impl IntoIterator<Item = Task>) -> Result<()> {
        let mut errors = Vec::new();

        for task in tasks {
            match task.join() {
                Ok(()) => {}
                Err(Error::Aggregate(aggregate)) => errors.extend(aggregate),
                Err(error) => errors.push(error.into()),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError::new(errors).into())
        }
    }
}

/// An action that failed by joining other tasks reports their errors, not a nested aggregate.
fn flatten(error: anyhow::Error) -> Vec<anyhow::Error> {
    match error.downcast::<Error>() {
        Ok(Error::Aggregate(aggregate)) => aggregate.into_errors(),
        Ok(error) => vec![error.into()],
        Err(error) => vec![error],
    }
}
