// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-key cache entries and their fetch state machine.

use std::{
    fmt::Debug,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use tick::Clock;
use tokio::sync::watch;

use crate::Error;

/// When the current value or failstate of an entry stops being fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The entry never goes stale on its own.
    Never,
    /// The entry is stale from this instant on, inclusive.
    At(Instant),
}

impl Expiry {
    fn after(now: Instant, window: Option<Duration>) -> Self {
        match window {
            Some(window) => now.checked_add(window).map_or(Self::Never, Self::At),
            None => Self::Never,
        }
    }

    fn has_passed(self, now: Instant) -> bool {
        match self {
            Self::Never => false,
            Self::At(at) => now >= at,
        }
    }
}

/// Freshness settings shared by every entry of one store.
#[derive(Debug)]
pub(crate) struct EntryPolicy {
    pub(crate) clock: Clock,
    pub(crate) ttl: Option<Duration>,
    pub(crate) failstate_ttl: Duration,
}

impl EntryPolicy {
    fn now(&self) -> Instant {
        self.clock.instant()
    }
}

/// The store side of an entry: somewhere to send "please fetch me".
pub(crate) trait FetchRequester<K>: Send + Sync {
    fn request_fetch(&self, key: &K);
}

#[derive(Debug, Clone)]
struct EntryState<V> {
    value: Option<V>,
    is_ready: bool,
    is_pending: bool,
    error: Option<Arc<Error>>,
    last_modified: Option<Instant>,
    expires_at: Expiry,
    version: u64,
}

impl<V> EntryState<V> {
    fn has_expired(&self, now: Instant) -> bool {
        self.expires_at.has_passed(now)
    }

    fn in_failstate(&self, now: Instant, failstate_ttl: Duration) -> bool {
        // A zero window keeps the failure until it is cleared explicitly.
        self.error.is_some() && (failstate_ttl.is_zero() || !self.has_expired(now))
    }

    fn should_fetch(&self, now: Instant, failstate_ttl: Duration) -> bool {
        !self.is_pending && (!self.is_ready || self.has_expired(now)) && !self.in_failstate(now, failstate_ttl)
    }

    fn status(&self, now: Instant, failstate_ttl: Duration) -> EntryStatus {
        EntryStatus {
            is_ready: self.is_ready,
            is_pending: self.is_pending,
            has_value: self.value.is_some(),
            has_error: self.error.is_some(),
            has_expired: self.has_expired(now),
            in_failstate: self.in_failstate(now, failstate_ttl),
            should_fetch: self.should_fetch(now, failstate_ttl),
            version: self.version,
        }
    }
}

/// A point-in-time view of an entry's flags.
///
/// Time-dependent flags (`has_expired`, `in_failstate`, `should_fetch`) are
/// evaluated against the store clock at the moment the snapshot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[expect(clippy::struct_excessive_bools, reason = "a flat snapshot of independent entry flags")]
pub struct EntryStatus {
    /// At least one fetch attempt for this key has completed.
    pub is_ready: bool,
    /// A fetch covering this key is queued or in flight.
    pub is_pending: bool,
    /// The entry holds a value.
    pub has_value: bool,
    /// The entry holds an error from its last fetch.
    pub has_error: bool,
    /// The current value or failstate is stale.
    pub has_expired: bool,
    /// The entry is refusing re-fetches because of a recent failure.
    pub in_failstate: bool,
    /// Reading the entry would queue a fetch.
    pub should_fetch: bool,
    /// Number of transitions applied to the entry so far.
    pub version: u64,
}

/// The cached state for a single key.
///
/// Entries are created lazily by a [`Store`](crate::Store) and shared with
/// callers as `Arc<Entry<K, V>>`. Every transition is applied atomically and
/// wakes tasks waiting in [`ready`](Self::ready) or [`changed`](Self::changed).
///
/// Reads come in two flavors: [`peek`](Self::peek) and [`value`](Self::value)
/// only inspect state, while [`get`](Self::get) also asks the owning store to
/// fetch the key when it is missing or stale.
pub struct Entry<K, V> {
    key: K,
    policy: Arc<EntryPolicy>,
    requester: Option<Weak<dyn FetchRequester<K>>>,
    state: watch::Sender<EntryState<V>>,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(key: K, policy: Arc<EntryPolicy>, requester: Option<Weak<dyn FetchRequester<K>>>) -> Self {
        Self {
            key,
            policy,
            requester,
            state: watch::Sender::new(EntryState {
                value: None,
                is_ready: false,
                is_pending: false,
                error: None,
                last_modified: None,
                expires_at: Expiry::Never,
                version: 0,
            }),
        }
    }

    /// The key this entry caches.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Whether this entry can ask a store to fetch it.
    ///
    /// Entries made by [`Store::create_async_container`](crate::Store::create_async_container)
    /// without registering them are detached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.requester.as_ref().is_some_and(|requester| requester.strong_count() > 0)
    }

    /// Returns the last fetched value without any side effects.
    #[must_use]
    pub fn peek(&self) -> Option<V>
    where
        V: Clone,
    {
        self.state.borrow().value.clone()
    }

    /// Returns the last fetched value, first asking the owning store to fetch
    /// the key if [`should_fetch`](Self::should_fetch) holds.
    ///
    /// Asking is idempotent: the store queues a key at most once.
    pub fn get(&self) -> Option<V>
    where
        V: Clone,
    {
        if self.should_fetch()
            && let Some(requester) = self.requester.as_ref().and_then(Weak::upgrade)
        {
            requester.request_fetch(&self.key);
        }

        self.peek()
    }

    /// The error recorded by the last failed fetch, if any.
    #[must_use]
    pub fn error(&self) -> Option<Arc<Error>> {
        self.state.borrow().error.clone()
    }

    /// At least one fetch attempt has completed for this key.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_ready
    }

    /// A fetch covering this key is queued or in flight.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.borrow().is_pending
    }

    /// When the value or failure was last written.
    #[must_use]
    pub fn last_modified(&self) -> Option<Instant> {
        self.state.borrow().last_modified
    }

    /// When the current value or failstate goes stale.
    #[must_use]
    pub fn expires_at(&self) -> Expiry {
        self.state.borrow().expires_at
    }

    /// The current value or failstate is stale.
    #[must_use]
    pub fn has_expired(&self) -> bool {
        self.state.borrow().has_expired(self.policy.now())
    }

    /// A recent failure suppresses re-fetching.
    ///
    /// With a zero failstate window this holds for as long as an error is
    /// stored, until [`clear_failstate`](Self::clear_failstate) is called.
    #[must_use]
    pub fn in_failstate(&self) -> bool {
        self.state.borrow().in_failstate(self.policy.now(), self.policy.failstate_ttl)
    }

    /// Reading this entry should trigger a fetch.
    ///
    /// True when the entry is not pending, has never been fetched or has
    /// expired, and is not in failstate.
    #[must_use]
    pub fn should_fetch(&self) -> bool {
        self.state.borrow().should_fetch(self.policy.now(), self.policy.failstate_ttl)
    }

    /// Takes a snapshot of every flag at once.
    #[must_use]
    pub fn status(&self) -> EntryStatus {
        self.state.borrow().status(self.policy.now(), self.policy.failstate_ttl)
    }

    /// Number of transitions applied to this entry.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.borrow().version
    }

    /// Marks the entry as (no longer) awaiting a fetch.
    ///
    /// Turning pending on clears any stored error, since a new attempt supersedes it.
    pub fn set_pending(&self, pending: bool) {
        self.transition(|state, _| {
            state.is_pending = pending;
            if pending {
                state.error = None;
            }
        });
    }

    /// Records a successful fetch.
    ///
    /// `None` records that the source has no item for this key.
    pub fn set_value(&self, value: Option<V>) {
        let ttl = self.policy.ttl;
        self.transition(|state, now| {
            state.value = value;
            state.error = None;
            state.is_pending = false;
            state.is_ready = true;
            state.last_modified = Some(now);
            state.expires_at = Expiry::after(now, ttl);
        });
    }

    /// Records a failed fetch. The previous value is kept.
    pub fn set_failstate(&self, error: impl Into<Arc<Error>>) {
        let error = error.into();
        let failstate_ttl = self.policy.failstate_ttl;
        self.transition(|state, now| {
            state.error = Some(error);
            state.is_pending = false;
            state.is_ready = true;
            state.last_modified = Some(now);
            state.expires_at = Expiry::after(now, Some(failstate_ttl));
        });
    }

    /// Settles the entry without touching its value or error.
    pub fn set_ready(&self) {
        self.transition(|state, _| {
            state.is_pending = false;
            state.is_ready = true;
        });
    }

    /// Forgets the stored failure and makes the entry immediately eligible for a fetch.
    pub fn clear_failstate(&self) {
        self.transition(|state, now| {
            state.error = None;
            state.expires_at = Expiry::At(now);
        });
    }

    /// Waits until a fetch attempt has completed and nothing is pending.
    ///
    /// An entry that is never requested stays unready, so this waits forever
    /// unless something asks for the key.
    pub async fn ready(&self) -> EntryStatus {
        let mut receiver = self.state.subscribe();
        let policy = &self.policy;
        receiver
            .wait_for(|state| state.is_ready && !state.is_pending)
            .await
            .map(|state| state.status(policy.now(), policy.failstate_ttl))
            .unwrap_or_else(|_| self.status())
    }

    /// Waits for the next transition of this entry.
    pub async fn changed(&self) -> EntryStatus {
        let mut receiver = self.state.subscribe();
        // The sender is owned by `self`, so the channel cannot close while we wait.
        let _closed = receiver.changed().await;
        self.status()
    }

    fn transition(&self, apply: impl FnOnce(&mut EntryState<V>, Instant)) {
        let now = self.policy.now();
        self.state.send_modify(|state| {
            apply(state, now);
            state.version += 1;
        });
    }
}

impl<K: Debug, V> Debug for Entry<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
