// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deduplicating FIFO of keys waiting to be fetched.

use std::{
    collections::{HashSet, VecDeque},
    hash::Hash,
};

/// The work taken out of the queue by one drain cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Batch<K> {
    /// Fetch the whole collection.
    All,
    /// Fetch these keys, in the order they were queued.
    Keys(Vec<K>),
}

/// Pending keys plus the "fetch everything" request.
///
/// A key is held at most once. The fetch-all request is a flag rather than a
/// reserved key, so no key value is off limits to callers.
#[derive(Debug)]
pub(crate) struct FetchQueue<K> {
    keys: VecDeque<K>,
    queued: HashSet<K>,
    all: bool,
}

impl<K> FetchQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub(crate) fn new() -> Self {
        Self {
            keys: VecDeque::new(),
            queued: HashSet::new(),
            all: false,
        }
    }

    /// Returns false if the key was already queued.
    pub(crate) fn push(&mut self, key: K) -> bool {
        if !self.queued.insert(key.clone()) {
            return false;
        }

        self.keys.push_back(key);
        true
    }

    /// Returns false if the fetch-all request was already queued.
    pub(crate) fn request_all(&mut self) -> bool {
        !std::mem::replace(&mut self.all, true)
    }

    pub(crate) fn is_all_requested(&self) -> bool {
        self.all
    }

    pub(crate) fn remove(&mut self, key: &K) -> bool {
        if !self.queued.remove(key) {
            return false;
        }

        self.keys.retain(|queued| queued != key);
        true
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.queued.contains(key)
    }

    /// Number of queued requests, counting the fetch-all request as one.
    pub(crate) fn len(&self) -> usize {
        self.keys.len() + usize::from(self.all)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a drain cycle would have a full load right now.
    pub(crate) fn is_batch_ready(&self, batch_size: usize) -> bool {
        self.all || self.keys.len() >= batch_size
    }

    /// Takes the next unit of work.
    ///
    /// The fetch-all request pre-empts any queued keys. Keys that the full fetch
    /// does not return stay queued for a later cycle.
    pub(crate) fn take(&mut self, batch_size: usize) -> Option<Batch<K>> {
        if std::mem::take(&mut self.all) {
            return Some(Batch::All);
        }

        if self.keys.is_empty() {
            return None;
        }

        let count = batch_size.clamp(1, self.keys.len());
        let keys: Vec<K> = self.keys.drain(..count).collect();
        for key in &keys {
            self.queued.remove(key);
        }

        Some(Batch::Keys(keys))
    }
}
