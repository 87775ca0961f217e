// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The store: a keyed collection of entries plus the queue that feeds fetches.

use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tick::Clock;
use tokio::sync::{Notify, watch};

use crate::{
    Entry, Error,
    builder::StoreBuilder,
    drain,
    entry::{EntryPolicy, FetchRequester},
    queue::{Batch, FetchQueue},
    runtime::Runtime,
    strategy::{FetchStrategies, Keyed},
    telemetry,
};

/// A point-in-time view of the store-wide flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStatus {
    /// A drain cycle is running.
    pub is_pending: bool,
    /// At least one drain cycle has completed.
    pub is_ready: bool,
    /// A full fetch has completed successfully.
    pub has_all: bool,
    /// Requests waiting in the queue, counting a full fetch request as one.
    pub queued: usize,
}

/// A key-addressed cache whose misses are coalesced into throttled, batched fetches.
///
/// Reads never block on the network: they return entries right away and queue
/// the keys that need fetching. A background worker drains the queue with the
/// configured strategies and writes results back into the entries, which
/// callers can await through [`Entry::ready`] or [`Store::settled`].
///
/// `Store` is a cheap handle; clones share the same entries and queue. The
/// worker stops once the last handle is dropped.
///
/// # Examples
///
/// ```
/// use corral::{Error, Store};
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Store::builder::<String, (String, usize)>(Clock::new_tokio())
///     .fetch_one(|id: String| async move { Ok::<_, Error>(Some((id.clone(), id.len()))) })
///     .build()?;
///
/// let entry = store.get_one("hello".to_string());
/// entry.ready().await;
/// assert_eq!(entry.peek().map(|(_, len)| len), Some(5));
/// # Ok(())
/// # }
/// ```
pub struct Store<K, V> {
    inner: Arc<StoreInner<K, V>>,
}

pub(crate) struct StoreConfig<K, V> {
    pub(crate) name: &'static str,
    pub(crate) clock: Clock,
    pub(crate) strategies: FetchStrategies<K, V>,
    pub(crate) ttl: Option<Duration>,
    pub(crate) failstate_ttl: Duration,
    pub(crate) batch_size: usize,
    pub(crate) throttle: Duration,
}

pub(crate) struct StoreInner<K, V> {
    pub(crate) name: &'static str,
    pub(crate) clock: Clock,
    pub(crate) strategies: FetchStrategies<K, V>,
    pub(crate) batch_size: usize,
    pub(crate) throttle: Duration,
    wake: Arc<Notify>,
    policy: Arc<EntryPolicy>,
    state: Mutex<StoreState<K, V>>,
    status: watch::Sender<StoreStatus>,
    this: Weak<Self>,
}

struct StoreState<K, V> {
    entries: HashMap<K, Arc<Entry<K, V>>>,
    order: Vec<K>,
    queue: FetchQueue<K>,
    is_pending: bool,
    is_ready: bool,
    has_all: bool,
    all_in_flight: bool,
    all_failed_at: Option<Instant>,
}

impl Store<(), ()> {
    /// Starts configuring a store that reads time from `clock`.
    ///
    /// # Examples
    ///
    /// ```
    /// use corral::{Error, Store};
    /// use tick::Clock;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = Store::builder::<u32, (u32, u32)>(Clock::new_tokio())
    ///     .fetch_all(|| async { Ok::<_, Error>(vec![(1, 10), (2, 20)]) })
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn builder<K, V>(clock: Clock) -> StoreBuilder<K, V> {
        StoreBuilder::new(clock)
    }
}

impl<K, V> Store<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Keyed<K> + Clone + Send + Sync + 'static,
{
    pub(crate) fn from_config(config: StoreConfig<K, V>, runtime: &Runtime) -> Self {
        let wake = Arc::new(Notify::new());
        let inner = Arc::new_cyclic(|this| StoreInner {
            name: config.name,
            policy: Arc::new(EntryPolicy {
                clock: config.clock.clone(),
                ttl: config.ttl,
                failstate_ttl: config.failstate_ttl,
            }),
            clock: config.clock,
            strategies: config.strategies,
            batch_size: config.batch_size,
            throttle: config.throttle,
            wake: Arc::clone(&wake),
            state: Mutex::new(StoreState {
                entries: HashMap::new(),
                order: Vec::new(),
                queue: FetchQueue::new(),
                is_pending: false,
                is_ready: false,
                has_all: false,
                all_in_flight: false,
                all_failed_at: None,
            }),
            status: watch::Sender::new(StoreStatus::default()),
            this: this.clone(),
        });

        runtime.spawn(drain::worker(Arc::downgrade(&inner), wake));

        Self { inner }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &StoreInner<K, V> {
        &self.inner
    }

    /// The name that identifies this store in log events.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Returns the entry for `key`, creating it if needed, and queues a fetch
    /// if the entry [should be fetched](Entry::should_fetch).
    pub fn get_one(&self, key: K) -> Arc<Entry<K, V>> {
        self.inner.get_one(key)
    }

    /// Like [`get_one`](Self::get_one) for several keys at once.
    ///
    /// Entries come back in the order of `keys`.
    pub fn get_many(&self, keys: impl IntoIterator<Item = K>) -> Vec<Arc<Entry<K, V>>> {
        let mut state = self.inner.state.lock();
        let mut queued = 0;
        let entries = keys
            .into_iter()
            .map(|key| {
                let entry = self.inner.get_or_insert(&mut state, key);
                if entry.should_fetch() && self.inner.enqueue(&mut state, entry.key().clone()) {
                    queued += 1;
                }
                entry
            })
            .collect();

        self.inner.after_enqueue(&state, queued);
        entries
    }

    /// Returns every known entry in creation order and, unless the collection
    /// has already been fetched in full, queues a full fetch.
    ///
    /// With `force` the full fetch is queued even if it already completed or
    /// recently failed. The returned entries only reflect the full fetch once
    /// [`has_all`](Self::has_all) turns true.
    pub fn get_all(&self, force: bool) -> Vec<Arc<Entry<K, V>>> {
        let mut state = self.inner.state.lock();
        let wanted = force
            || (!state.has_all
                && !state.all_in_flight
                && !state.queue.is_all_requested()
                && !self.inner.in_all_failstate(&state, self.inner.clock.instant()));

        let queued = usize::from(wanted && state.queue.request_all());
        self.inner.after_enqueue(&state, queued);
        StoreInner::ordered_entries(&state)
    }

    /// Returns the entry for `key`, creating one if it does not exist yet.
    ///
    /// A new entry is registered in the store only when `add` is true.
    /// Otherwise it is detached: reading it never queues a fetch.
    pub fn create_async_container(&self, key: K, add: bool) -> Arc<Entry<K, V>> {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.entries.get(&key) {
            return Arc::clone(entry);
        }

        if add {
            self.inner.get_or_insert(&mut state, key)
        } else {
            Arc::new(Entry::new(key, Arc::clone(&self.inner.policy), None))
        }
    }

    /// Queues `key` for fetching regardless of its entry's state.
    ///
    /// Queueing is idempotent while the key waits. A key without an entry gets
    /// one when its fetch starts.
    pub fn add_to_fetch_queue(&self, key: K) {
        self.add_many_to_fetch_queue([key]);
    }

    /// Queues several keys for fetching regardless of their entries' state.
    pub fn add_many_to_fetch_queue(&self, keys: impl IntoIterator<Item = K>) {
        let mut state = self.inner.state.lock();
        let queued = keys
            .into_iter()
            .filter(|key| self.inner.enqueue(&mut state, key.clone()))
            .count();
        self.inner.after_enqueue(&state, queued);
    }

    /// Reads the value for `key`, queueing a fetch if one is due.
    pub fn value(&self, key: K) -> Option<V> {
        self.get_one(key).peek()
    }

    /// Returns the entry for `key` without creating it or queueing anything.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<Arc<Entry<K, V>>> {
        self.inner.entry(key)
    }

    /// Every registered entry, in creation order.
    #[must_use]
    pub fn values(&self) -> Vec<Arc<Entry<K, V>>> {
        StoreInner::ordered_entries(&self.inner.state.lock())
    }

    /// The errors currently stored on entries, by key.
    #[must_use]
    pub fn errors(&self) -> HashMap<K, Arc<Error>> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .filter_map(|(key, entry)| entry.error().map(|error| (key.clone(), error)))
            .collect()
    }

    /// Whether any entry holds an error from its last fetch.
    #[must_use]
    pub fn in_failstate(&self) -> bool {
        self.inner.state.lock().entries.values().any(|entry| entry.error().is_some())
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Whether no entry has been registered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry is registered for `key`.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.state.lock().entries.contains_key(key)
    }

    /// Takes a snapshot of the store-wide flags.
    #[must_use]
    pub fn status(&self) -> StoreStatus {
        *self.inner.status.borrow()
    }

    /// A drain cycle is running.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status().is_pending
    }

    /// At least one drain cycle has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status().is_ready
    }

    /// A full fetch has completed successfully.
    #[must_use]
    pub fn has_all(&self) -> bool {
        self.status().has_all
    }

    /// Waits until the queue is empty and no drain cycle is running.
    pub async fn settled(&self) -> StoreStatus {
        let mut receiver = self.inner.status.subscribe();
        receiver
            .wait_for(|status| !status.is_pending && status.queued == 0)
            .await
            .map(|status| *status)
            .unwrap_or_else(|_| self.status())
    }
}

impl<K, V> StoreInner<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Keyed<K> + Clone + Send + Sync + 'static,
{
    fn get_one(&self, key: K) -> Arc<Entry<K, V>> {
        let mut state = self.state.lock();
        let entry = self.get_or_insert(&mut state, key);
        let queued = usize::from(entry.should_fetch() && self.enqueue(&mut state, entry.key().clone()));
        self.after_enqueue(&state, queued);
        entry
    }

    fn entry(&self, key: &K) -> Option<Arc<Entry<K, V>>> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Looks up the entry for a key that is being fetched, creating it if the
    /// queue and the entry map have drifted apart.
    pub(crate) fn entry_or_desync(&self, key: &K) -> Arc<Entry<K, V>> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(key) {
            return Arc::clone(entry);
        }

        telemetry::record_desync(self.name, key);
        self.get_or_insert(&mut state, key.clone())
    }

    fn get_or_insert(&self, state: &mut StoreState<K, V>, key: K) -> Arc<Entry<K, V>> {
        if let Some(entry) = state.entries.get(&key) {
            return Arc::clone(entry);
        }

        let requester: Weak<dyn FetchRequester<K>> = self.this.clone();
        let entry = Arc::new(Entry::new(key.clone(), Arc::clone(&self.policy), Some(requester)));
        state.order.push(key.clone());
        state.entries.insert(key, Arc::clone(&entry));
        entry
    }

    /// Queues `key` and marks its entry pending. Returns false if it was already queued.
    fn enqueue(&self, state: &mut StoreState<K, V>, key: K) -> bool {
        if !state.queue.push(key.clone()) {
            return false;
        }

        if let Some(entry) = state.entries.get(&key) {
            entry.set_pending(true);
        }

        true
    }

    fn after_enqueue(&self, state: &StoreState<K, V>, queued: usize) {
        if queued == 0 {
            return;
        }

        telemetry::record_enqueued(self.name, queued);
        self.publish(state);
        self.wake.notify_one();
    }

    fn in_all_failstate(&self, state: &StoreState<K, V>, now: Instant) -> bool {
        let failstate_ttl = self.policy.failstate_ttl;
        state
            .all_failed_at
            .is_some_and(|failed_at| failstate_ttl.is_zero() || failed_at.checked_add(failstate_ttl).is_none_or(|until| now < until))
    }

    fn ordered_entries(state: &StoreState<K, V>) -> Vec<Arc<Entry<K, V>>> {
        state.order.iter().filter_map(|key| state.entries.get(key).cloned()).collect()
    }

    fn publish(&self, state: &StoreState<K, V>) {
        let next = StoreStatus {
            is_pending: state.is_pending,
            is_ready: state.is_ready,
            has_all: state.has_all,
            queued: state.queue.len(),
        };

        self.status.send_if_modified(|status| {
            if *status == next {
                return false;
            }

            *status = next;
            true
        });
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }

    pub(crate) fn is_batch_ready(&self) -> bool {
        self.state.lock().queue.is_batch_ready(self.batch_size)
    }

    /// Takes the next batch and marks the store pending in one step.
    pub(crate) fn begin_cycle(&self) -> Option<Batch<K>> {
        let mut state = self.state.lock();
        let batch = state.queue.take(self.batch_size)?;
        state.all_in_flight = matches!(batch, Batch::All);
        state.is_pending = true;
        self.publish(&state);
        Some(batch)
    }

    pub(crate) fn end_cycle(&self) {
        let mut state = self.state.lock();
        state.is_pending = false;
        state.is_ready = true;
        self.publish(&state);
    }

    /// Writes the result of a successful full fetch.
    ///
    /// Every returned item gets an entry and leaves the queue. The store
    /// counts as complete even when nothing came back.
    pub(crate) fn complete_all(&self, items: Vec<V>) {
        let mut state = self.state.lock();
        for item in items {
            let key = item.key();
            state.queue.remove(&key);
            self.get_or_insert(&mut state, key).set_value(Some(item));
        }

        state.has_all = true;
        state.all_in_flight = false;
        state.all_failed_at = None;
        self.publish(&state);
    }

    /// Writes one item returned by a batch fetch to its entry.
    ///
    /// The key also leaves the queue, since the item already answers it.
    /// Returns false when no entry is registered for the item.
    pub(crate) fn deliver(&self, item: V) -> bool {
        let key = item.key();
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get(&key).cloned() else {
            return false;
        };

        if state.queue.remove(&key) {
            self.publish(&state);
        }
        entry.set_value(Some(item));
        true
    }

    pub(crate) fn fail_all(&self) {
        let mut state = self.state.lock();
        state.all_in_flight = false;
        state.all_failed_at = Some(self.clock.instant());
        self.publish(&state);
    }
}

impl<K, V> FetchRequester<K> for StoreInner<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Keyed<K> + Clone + Send + Sync + 'static,
{
    fn request_fetch(&self, key: &K) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get(key).cloned() else {
            return;
        };

        let queued = usize::from(entry.should_fetch() && self.enqueue(&mut state, key.clone()));
        self.after_enqueue(&state, queued);
    }
}

impl<K, V> Drop for StoreInner<K, V> {
    fn drop(&mut self) {
        // Lets a parked worker notice the store is gone.
        self.wake.notify_one();
    }
}

impl<K, V> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Debug for Store<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("status", &*self.inner.status.borrow())
            .field("strategies", &self.inner.strategies)
            .finish_non_exhaustive()
    }
}
