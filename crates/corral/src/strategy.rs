// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Caller-supplied fetch functions.

use std::{fmt::Debug, sync::Arc};

use futures::future::BoxFuture;

use crate::Result;

/// Items returned by fetch strategies identify the key they belong to.
///
/// The store uses this to route items from batch and full fetches back to
/// their entries, regardless of the order the backend returns them in.
///
/// # Examples
///
/// ```
/// use corral::Keyed;
///
/// #[derive(Clone)]
/// struct User {
///     id: u64,
///     name: String,
/// }
///
/// impl Keyed<u64> for User {
///     fn key(&self) -> u64 {
///         self.id
///     }
/// }
/// ```
pub trait Keyed<K> {
    /// The key of the entry this item belongs to.
    fn key(&self) -> K;
}

/// A `(key, payload)` pair is keyed by its first element.
impl<K: Clone, T> Keyed<K> for (K, T) {
    fn key(&self) -> K {
        self.0.clone()
    }
}

pub(crate) type FetchOneFn<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<Option<V>>> + Send + Sync>;
pub(crate) type FetchManyFn<K, V> = Arc<dyn Fn(Vec<K>) -> BoxFuture<'static, Result<Vec<V>>> + Send + Sync>;
pub(crate) type FetchAllFn<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<V>>> + Send + Sync>;

/// The optional set of ways a store can load items.
pub(crate) struct FetchStrategies<K, V> {
    pub(crate) one: Option<FetchOneFn<K, V>>,
    pub(crate) many: Option<FetchManyFn<K, V>>,
    pub(crate) all: Option<FetchAllFn<V>>,
}

impl<K, V> FetchStrategies<K, V> {
    pub(crate) fn none() -> Self {
        Self {
            one: None,
            many: None,
            all: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.one.is_none() && self.many.is_none() && self.all.is_none()
    }

    /// A single key can be served by either the single or the batch strategy.
    pub(crate) fn can_fetch_one(&self) -> bool {
        self.one.is_some() || self.many.is_some()
    }

    /// Without a batch strategy keys can only be fetched one at a time.
    pub(crate) fn effective_batch_size(&self, configured: usize) -> usize {
        if self.many.is_some() { configured } else { 1 }
    }
}

impl<K, V> Debug for FetchStrategies<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchStrategies")
            .field("one", &self.one.is_some())
            .field("many", &self.many.is_some())
            .field("all", &self.all.is_some())
            .finish()
    }
}
