// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for fetch coordination.

/// An error produced by a fetch strategy.
///
/// This is an opaque error type that wraps whatever the caller's fetch
/// function failed with. It is stored on every entry the failed fetch
/// covered and never propagated out of the store's read API.
///
/// # Example
///
/// ```
/// use corral::Error;
///
/// let error = Error::from_message("backend unavailable");
/// assert!(error.to_string().contains("backend unavailable"));
/// ```
#[ohno::error]
pub struct Error {}

impl Error {
    /// Creates a new error from any type that can be converted to an error.
    ///
    /// # Examples
    ///
    /// ```
    /// use corral::Error;
    ///
    /// let error = Error::from_message(format!("item {} not found", 7));
    /// ```
    pub fn from_message(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(cause)
    }
}

/// A specialized [`Result`] type for fetch strategies.
pub type Result<T> = std::result::Result<T, Error>;

/// A fetch operation was requested but the store has no strategy to serve it.
///
/// Drain cycles never surface this error directly. They log it and record it as
/// failstate on every entry the cycle targeted, so that no entry stays pending.
#[ohno::error]
#[display("not implemented: no {strategy} fetch strategy is configured")]
pub struct NotConfigured {
    strategy: &'static str,
}

impl NotConfigured {
    /// The name of the missing strategy (`fetch_one`, `fetch_many` or `fetch_all`).
    #[must_use]
    pub fn strategy(&self) -> &'static str {
        self.strategy
    }
}

/// The store configuration was rejected by [`StoreBuilder::build`](crate::StoreBuilder::build).
#[ohno::error]
#[display("invalid store configuration: {reason}")]
pub struct BuildError {
    reason: &'static str,
}

impl BuildError {
    /// Describes what is wrong with the configuration.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}
