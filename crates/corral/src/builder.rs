// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Store configuration.

use std::{fmt::Debug, sync::Arc, time::Duration};

use futures::FutureExt;
use tick::Clock;

use crate::{
    BuildError, Result, Store,
    runtime::Runtime,
    store::StoreConfig,
    strategy::{FetchStrategies, Keyed},
};

/// Store name used in log events when none is configured.
pub const DEFAULT_NAME: &str = "corral";

/// How long a failed fetch suppresses re-fetching, unless configured otherwise.
pub const DEFAULT_FAILSTATE_TTL: Duration = Duration::from_secs(5);

/// Maximum number of keys per batch fetch, unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 40;

/// Delay between the queue becoming non-empty and a drain, unless configured otherwise.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(200);

/// Builder for a [`Store`].
///
/// Created by calling [`Store::builder`]. At least one fetch strategy must be
/// configured before calling [`build`](Self::build).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use corral::{Error, Store};
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Store::builder::<u64, (u64, String)>(Clock::new_tokio())
///     .name("users")
///     .fetch_many(|ids: Vec<u64>| async move {
///         Ok::<_, Error>(ids.into_iter().map(|id| (id, format!("user {id}"))).collect())
///     })
///     .ttl(Duration::from_secs(60))
///     .batch_size(100)
///     .build()?;
///
/// assert_eq!(store.name(), "users");
/// # Ok(())
/// # }
/// ```
pub struct StoreBuilder<K, V> {
    name: &'static str,
    clock: Clock,
    strategies: FetchStrategies<K, V>,
    ttl: Option<Duration>,
    failstate_ttl: Duration,
    batch_size: usize,
    throttle: Duration,
}

impl<K, V> StoreBuilder<K, V> {
    pub(crate) fn new(clock: Clock) -> Self {
        Self {
            name: DEFAULT_NAME,
            clock,
            strategies: FetchStrategies::none(),
            ttl: None,
            failstate_ttl: DEFAULT_FAILSTATE_TTL,
            batch_size: DEFAULT_BATCH_SIZE,
            throttle: DEFAULT_THROTTLE,
        }
    }

    /// Sets the name that identifies this store in log events.
    #[must_use]
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Sets how to fetch a single item.
    ///
    /// Returning `Ok(None)` records that the source has no item for the key.
    #[must_use]
    pub fn fetch_one<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        self.strategies.one = Some(Arc::new(move |key| fetch(key).boxed()));
        self
    }

    /// Sets how to fetch a batch of items.
    ///
    /// Returned items are matched to entries through [`Keyed`], so they may come
    /// back in any order. Requested keys without an item are settled as-is.
    #[must_use]
    pub fn fetch_many<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<V>>> + Send + 'static,
    {
        self.strategies.many = Some(Arc::new(move |keys| fetch(keys).boxed()));
        self
    }

    /// Sets how to fetch the whole collection.
    #[must_use]
    pub fn fetch_all<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<V>>> + Send + 'static,
    {
        self.strategies.all = Some(Arc::new(move || fetch().boxed()));
        self
    }

    /// Sets how long a fetched value stays fresh. Values never expire by default.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets how long a failed fetch suppresses re-fetching.
    ///
    /// A zero window keeps failures until they are cleared explicitly.
    #[must_use]
    pub fn failstate_ttl(mut self, failstate_ttl: Duration) -> Self {
        self.failstate_ttl = failstate_ttl;
        self
    }

    /// Sets the maximum number of keys fetched by one batch call.
    ///
    /// Only meaningful together with [`fetch_many`](Self::fetch_many); without it
    /// keys are fetched one at a time.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets how long to wait for more keys before draining the queue.
    #[must_use]
    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }
}

impl<K, V> StoreBuilder<K, V>
where
    K: Clone + Eq + std::hash::Hash + Debug + Send + Sync + 'static,
    V: Keyed<K> + Clone + Send + Sync + 'static,
{
    /// Builds the store and starts its drain worker on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if no fetch strategy is configured, if the batch size is
    /// zero, or if called outside a tokio runtime.
    pub fn build(self) -> std::result::Result<Store<K, V>, BuildError> {
        if self.strategies.is_empty() {
            return Err(BuildError::new("no fetch strategy is configured"));
        }

        if self.batch_size == 0 {
            return Err(BuildError::new("batch size must be greater than zero"));
        }

        let runtime = Runtime::current()?;
        let batch_size = self.strategies.effective_batch_size(self.batch_size);

        Ok(Store::from_config(
            StoreConfig {
                name: self.name,
                clock: self.clock,
                strategies: self.strategies,
                ttl: self.ttl,
                failstate_ttl: self.failstate_ttl,
                batch_size,
                throttle: self.throttle,
            },
            &runtime,
        ))
    }
}

impl<K, V> Debug for StoreBuilder<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("name", &self.name)
            .field("strategies", &self.strategies)
            .field("ttl", &self.ttl)
            .field("failstate_ttl", &self.failstate_ttl)
            .field("batch_size", &self.batch_size)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}
