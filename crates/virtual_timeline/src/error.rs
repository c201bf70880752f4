// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::fmt;

/// The result type for fallible operations that use the [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur when working with a [`Timeline`][crate::Timeline].
///
/// There are three kinds of errors:
///
/// * [`Error::InvalidArgument`] - the timeline was constructed from an origin that is not UTC.
/// * [`Error::InvalidOperation`] - an operation was attempted in a state that does not allow it,
///   such as subscribing to a timer after the clock has already moved.
/// * [`Error::Aggregate`] - one or more task actions failed; the failures surface when the tasks
///   are joined.
///
/// # Examples
///
/// ```
/// use jiff::tz::{self, TimeZone};
/// use jiff::Timestamp;
/// use virtual_timeline::{Error, Timeline};
///
/// let origin = Timestamp::UNIX_EPOCH.to_zoned(TimeZone::fixed(tz::offset(9)));
/// let error = Timeline::new(&origin).unwrap_err();
///
/// assert!(matches!(error, Error::InvalidArgument { name: "origin", .. }));
/// ```
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument was rejected.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument {
        /// The name of the rejected argument.
        name: &'static str,
        /// Why the argument was rejected.
        reason: Cow<'static, str>,
    },

    /// The operation is not allowed in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(Cow<'static, str>),

    /// One or more task actions failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl Error {
    pub(crate) fn invalid_argument(name: &'static str, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_operation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Returns the inner task errors if this is an [`Error::Aggregate`].
    #[must_use]
    pub fn as_aggregate(&self) -> Option<&AggregateError> {
        match self {
            Self::Aggregate(aggregate) => Some(aggregate),
            _ => None,
        }
    }
}

/// A collection of errors raised by task actions, kept in the order they were captured.
///
/// An `AggregateError` is returned by [`Task::join`][crate::Task::join] and
/// [`TaskJoin::join_all`][crate::TaskJoin::join_all]. It always contains at least one error.
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<anyhow::Error>,
}

impl AggregateError {
    pub(crate) fn new(errors: Vec<anyhow::Error>) -> Self {
        debug_assert!(!errors.is_empty(), "an aggregate error always carries at least one error");
        Self { errors }
    }

    /// Returns the number of inner errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns `true` if there are no inner errors.
    ///
    /// Aggregates built by this crate are never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the inner errors in capture order.
    #[must_use]
    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }

    /// Returns an iterator over the inner errors in capture order.
    pub fn iter(&self) -> std::slice::Iter<'_, anyhow::Error> {
        self.errors.iter()
    }

    /// Consumes the aggregate and returns the inner errors.
    #[must_use]
    pub fn into_errors(self) -> Vec<anyhow::Error> {
        self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task error(s) occurred", self.errors.len())?;

        for (index, error) in self.errors.iter().enumerate() {
            write!(f, "\n  [{index}] {error}")?;
        }

        Ok(())
    }
}

impl std::error::Error for AggregateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors.first().map(|error| &**error as &(dyn std::error::Error + 'static))
    }
}

impl IntoIterator for AggregateError {
    type Item = anyhow::Error;
    type IntoIter = std::vec::IntoIter<anyhow::Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a AggregateError {
    type Item = &'a anyhow::Error;
    type IntoIter = std::slice::Iter<'a, anyhow::Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}
