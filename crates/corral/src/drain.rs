// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The background worker that turns queued keys into fetch calls.
//!
//! One worker runs per store, so at most one drain cycle is in flight at a
//! time. The worker parks while the queue is empty, waits out the throttle
//! once work shows up, and then runs a cycle: either one full fetch or one
//! batch of at most `batch_size` keys.

use std::{
    collections::HashSet,
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Weak},
};

use tokio::sync::Notify;

use crate::{
    Error, NotConfigured,
    queue::Batch,
    store::StoreInner,
    strategy::Keyed,
    telemetry::{self, FetchOperation, StoreActivity, Timed, timed},
};

pub(crate) async fn worker<K, V>(store: Weak<StoreInner<K, V>>, wake: Arc<Notify>)
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Keyed<K> + Clone + Send + Sync + 'static,
{
    // A cold store serves its first request without waiting.
    let mut cold = true;

    loop {
        let Some(inner) = store.upgrade() else { return };
        if !inner.has_queued() {
            drop(inner);
            wake.notified().await;
            continue;
        }

        if !cold {
            let clock = inner.clock.clone();
            let throttle = inner.throttle;
            drop(inner);

            // Each new request restarts the wait, unless a full load is already queued.
            loop {
                tokio::select! {
                    biased;
                    () = clock.delay(throttle) => break,
                    () = wake.notified() => {
                        let Some(inner) = store.upgrade() else { return };
                        if inner.is_batch_ready() {
                            break;
                        }
                    }
                }
            }
        }

        let Some(inner) = store.upgrade() else { return };
        cold = false;
        inner.drain_cycle().await;
    }
}

impl<K, V> StoreInner<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Keyed<K> + Clone + Send + Sync + 'static,
{
    /// Runs one drain cycle, if anything is queued.
    pub(crate) async fn drain_cycle(&self) {
        let Some(batch) = self.begin_cycle() else {
            return;
        };

        match batch {
            Batch::All => {
                if let Err(error) = self.fetch_all().await {
                    self.report_not_configured(FetchOperation::All, 0, &error);
                    self.fail_all();
                }
            }
            Batch::Keys(keys) => {
                let outcome = match keys.as_slice() {
                    [key] if self.strategies.can_fetch_one() => self.fetch_one(key.clone()).await,
                    _ => self.fetch_many(keys.clone()).await,
                };

                if let Err(error) = outcome {
                    let operation = if keys.len() == 1 { FetchOperation::One } else { FetchOperation::Many };
                    self.report_not_configured(operation, keys.len(), &error);

                    // Nothing may stay pending, so the missing strategy becomes the failure.
                    let error = Arc::new(Error::from_message(error));
                    for key in &keys {
                        self.entry_or_desync(key).set_failstate(Arc::clone(&error));
                    }
                }
            }
        }

        self.end_cycle();
    }

    /// Fetches a single key and writes the outcome to its entry.
    ///
    /// Uses the single-item strategy when configured and falls back to a batch
    /// of one otherwise.
    pub(crate) async fn fetch_one(&self, key: K) -> Result<(), NotConfigured> {
        let Timed { result, duration } = match (&self.strategies.one, &self.strategies.many) {
            (Some(fetch), _) => {
                self.entry_or_desync(&key).set_pending(true);
                timed(&self.clock, fetch(key.clone())).await
            }
            (None, Some(fetch)) => {
                self.entry_or_desync(&key).set_pending(true);
                let Timed { result, duration } = timed(&self.clock, fetch(vec![key.clone()])).await;
                Timed {
                    result: result.map(|items| items.into_iter().find(|item| item.key() == key)),
                    duration,
                }
            }
            (None, None) => return Err(NotConfigured::new(FetchOperation::One.strategy())),
        };

        let entry = self.entry_or_desync(&key);
        match result {
            Ok(value) => {
                telemetry::record(self.name, FetchOperation::One, StoreActivity::Fetched, 1, Some(duration), None);
                entry.set_value(value);
            }
            Err(error) => {
                telemetry::record(self.name, FetchOperation::One, StoreActivity::Failed, 1, Some(duration), Some(&error));
                entry.set_failstate(error);
            }
        }

        Ok(())
    }

    /// Fetches a batch of keys and routes the returned items back to their entries.
    ///
    /// A failed call puts every entry of the batch into failstate with the same error.
    pub(crate) async fn fetch_many(&self, keys: Vec<K>) -> Result<(), NotConfigured> {
        let Some(fetch) = &self.strategies.many else {
            return Err(NotConfigured::new(FetchOperation::Many.strategy()));
        };

        let entries: Vec<_> = keys
            .iter()
            .map(|key| {
                let entry = self.entry_or_desync(key);
                entry.set_pending(true);
                entry
            })
            .collect();

        let Timed { result, duration } = timed(&self.clock, fetch(keys)).await;
        match result {
            Ok(items) => {
                telemetry::record(self.name, FetchOperation::Many, StoreActivity::Fetched, entries.len(), Some(duration), None);

                let mut written = HashSet::with_capacity(items.len());
                for item in items {
                    let key = item.key();
                    if self.deliver(item) {
                        written.insert(key);
                    } else {
                        telemetry::record_unknown_item(self.name, &key);
                    }
                }

                for entry in entries.iter().filter(|entry| !written.contains(entry.key())) {
                    entry.set_ready();
                }
            }
            Err(error) => {
                telemetry::record(
                    self.name,
                    FetchOperation::Many,
                    StoreActivity::Failed,
                    entries.len(),
                    Some(duration),
                    Some(&error),
                );

                let error = Arc::new(error);
                for entry in &entries {
                    entry.set_failstate(Arc::clone(&error));
                }
            }
        }

        Ok(())
    }

    /// Fetches the whole collection.
    ///
    /// On failure entries are left alone; the store remembers the failure so
    /// that unforced full reads do not retry until the failstate window lapses.
    pub(crate) async fn fetch_all(&self) -> Result<(), NotConfigured> {
        let Some(fetch) = &self.strategies.all else {
            return Err(NotConfigured::new(FetchOperation::All.strategy()));
        };

        let Timed { result, duration } = timed(&self.clock, fetch()).await;
        match result {
            Ok(items) => {
                telemetry::record(self.name, FetchOperation::All, StoreActivity::Fetched, items.len(), Some(duration), None);
                self.complete_all(items);
            }
            Err(error) => {
                telemetry::record(self.name, FetchOperation::All, StoreActivity::Failed, 0, Some(duration), Some(&error));
                self.fail_all();
            }
        }

        Ok(())
    }

    fn report_not_configured(&self, operation: FetchOperation, keys: usize, error: &NotConfigured) {
        telemetry::record(self.name, operation, StoreActivity::NotConfigured, keys, None, Some(error));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tick::ClockControl;

    use crate::Store;
    use crate::telemetry::testing::CapturedLogs;

    use super::*;

    type Item = (&'static str, u32);

    fn only_all(control: &ClockControl) -> Store<&'static str, Item> {
        Store::builder::<&'static str, Item>(control.to_clock())
            .throttle(Duration::ZERO)
            .fetch_all(|| async { Ok::<_, Error>(vec![("a", 1)]) })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn fetch_one_needs_a_single_or_batch_strategy() {
        let control = ClockControl::new();
        let store = only_all(&control);

        let error = store.inner().fetch_one("a").await.unwrap_err();

        assert_eq!(error.strategy(), "fetch_one");
    }

    #[tokio::test]
    async fn fetch_many_needs_a_batch_strategy() {
        let control = ClockControl::new();
        let store = only_all(&control);

        let error = store.inner().fetch_many(vec!["a", "b"]).await.unwrap_err();

        assert_eq!(error.strategy(), "fetch_many");
    }

    #[tokio::test]
    async fn fetch_all_needs_a_full_strategy() {
        let control = ClockControl::new();
        let store = Store::builder::<&'static str, Item>(control.to_clock())
            .fetch_one(|key: &'static str| async move { Ok::<_, Error>(Some((key, 0))) })
            .build()
            .unwrap();

        let error = store.inner().fetch_all().await.unwrap_err();

        assert_eq!(error.strategy(), "fetch_all");
        assert!(!store.has_all());
    }

    #[tokio::test]
    async fn fetch_one_falls_back_to_a_batch_of_one() {
        let control = ClockControl::new();
        let store = Store::builder::<&'static str, Item>(control.to_clock())
            .fetch_many(|_keys: Vec<&'static str>| async { Ok::<_, Error>(vec![("other", 1), ("a", 2)]) })
            .build()
            .unwrap();
        let entry = store.create_async_container("a", true);

        store.inner().fetch_one("a").await.unwrap();

        assert_eq!(entry.peek(), Some(("a", 2)));
        assert!(entry.is_ready());
    }

    #[tokio::test]
    async fn fetch_one_records_a_missing_item_as_empty() {
        let control = ClockControl::new();
        let store = Store::builder::<&'static str, Item>(control.to_clock())
            .fetch_many(|_keys: Vec<&'static str>| async { Ok::<_, Error>(Vec::new()) })
            .build()
            .unwrap();

        store.inner().fetch_one("a").await.unwrap();

        let entry = store.peek(&"a").expect("the fetch creates the entry");
        assert_eq!(entry.peek(), None);
        assert!(entry.is_ready());
        assert!(entry.error().is_none());
    }

    #[tokio::test]
    async fn fetch_many_ignores_items_without_an_entry() {
        let control = ClockControl::new();
        let store = Store::builder::<&'static str, Item>(control.to_clock())
            .fetch_many(|_keys: Vec<&'static str>| async { Ok::<_, Error>(vec![("a", 1), ("stray", 2)]) })
            .build()
            .unwrap();

        store.inner().fetch_many(vec!["a"]).await.unwrap();

        assert!(store.contains_key(&"a"));
        assert!(!store.contains_key(&"stray"));
    }

    #[tokio::test]
    async fn drain_cycle_without_work_is_a_no_op() {
        let control = ClockControl::new();
        let store = only_all(&control);

        store.inner().drain_cycle().await;

        assert!(!store.is_ready());
        assert!(!store.is_pending());
    }

    #[tokio::test]
    async fn queued_key_without_an_entry_is_created_with_a_warning() {
        let (logs, _guard) = CapturedLogs::install();
        let control = ClockControl::new();
        let store = Store::builder::<&'static str, Item>(control.to_clock())
            .throttle(Duration::ZERO)
            .fetch_one(|key: &'static str| async move { Ok::<_, Error>(Some((key, 1))) })
            .build()
            .unwrap();

        store.add_to_fetch_queue("a");
        assert!(!store.contains_key(&"a"));
        store.settled().await;

        let line = logs.line_with("store.desync");
        assert!(line.contains("WARN"), "{line}");
        assert!(line.contains("store.key"), "{line}");
        let entry = store.peek(&"a").expect("the drain creates the entry");
        assert_eq!(entry.peek(), Some(("a", 1)));
    }

    #[tokio::test]
    async fn batch_fetches_are_logged_with_the_store_name() {
        let (logs, _guard) = CapturedLogs::install();
        let control = ClockControl::new();
        let store = Store::builder::<&'static str, Item>(control.to_clock())
            .name("items")
            .throttle(Duration::ZERO)
            .fetch_many(|keys: Vec<&'static str>| async move { Ok::<_, Error>(keys.into_iter().map(|key| (key, 0)).collect()) })
            .build()
            .unwrap();

        let _entries = store.get_many(["a", "b"]);
        store.settled().await;

        let line = logs.line_with("store.fetch_many");
        assert!(line.contains("store.name=\"items\""), "{line}");
        assert!(line.contains("store.activity=\"store.fetched\""), "{line}");
        assert!(line.contains("store.keys=2"), "{line}");
    }
}
