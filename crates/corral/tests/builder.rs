// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tests for store configuration and validation.

use std::time::Duration;

use corral::{DEFAULT_BATCH_SIZE, DEFAULT_FAILSTATE_TTL, DEFAULT_NAME, DEFAULT_THROTTLE, Error, Store};
use tick::{Clock, ClockControl};

type Item = (u32, String);

async fn fetch_one(id: u32) -> Result<Option<Item>, Error> {
    Ok(Some((id, format!("item {id}"))))
}

#[test]
fn defaults_match_documented_values() {
    assert_eq!(DEFAULT_NAME, "corral");
    assert_eq!(DEFAULT_BATCH_SIZE, 40);
    assert_eq!(DEFAULT_THROTTLE, Duration::from_millis(200));
    assert_eq!(DEFAULT_FAILSTATE_TTL, Duration::from_secs(5));
}

#[tokio::test]
async fn build_uses_the_default_name() {
    let store = Store::builder::<u32, Item>(Clock::new_frozen()).fetch_one(fetch_one).build().unwrap();

    assert_eq!(store.name(), DEFAULT_NAME);
    assert!(store.is_empty());
    assert!(!store.is_ready());
    assert!(!store.has_all());
}

#[tokio::test]
async fn build_keeps_the_configured_name() {
    let store = Store::builder::<u32, Item>(Clock::new_frozen())
        .name("items")
        .fetch_one(fetch_one)
        .build()
        .unwrap();

    assert_eq!(store.name(), "items");
}

#[tokio::test]
async fn build_requires_a_fetch_strategy() {
    let error = Store::builder::<u32, Item>(Clock::new_frozen())
        .ttl(Duration::from_secs(1))
        .build()
        .unwrap_err();

    assert_eq!(error.reason(), "no fetch strategy is configured");
}

#[tokio::test]
async fn build_rejects_a_zero_batch_size() {
    let error = Store::builder::<u32, Item>(Clock::new_frozen())
        .fetch_many(|ids: Vec<u32>| async move { Ok::<_, Error>(ids.into_iter().map(|id| (id, String::new())).collect()) })
        .batch_size(0)
        .build()
        .unwrap_err();

    assert_eq!(error.reason(), "batch size must be greater than zero");
}

#[test]
fn build_requires_a_tokio_runtime() {
    let error = Store::builder::<u32, Item>(Clock::new_frozen())
        .fetch_one(fetch_one)
        .build()
        .unwrap_err();

    assert!(error.to_string().contains("tokio runtime"));
}

#[tokio::test]
async fn store_can_be_used_outside_the_runtime_once_built() {
    let control = ClockControl::new();
    let store = Store::builder::<u32, Item>(control.to_clock())
        .throttle(Duration::ZERO)
        .fetch_one(fetch_one)
        .build()
        .unwrap();

    let entry = std::thread::spawn({
        let store = store.clone();
        move || store.get_one(3)
    })
    .join()
    .unwrap();

    entry.ready().await;
    assert_eq!(entry.peek(), Some((3, "item 3".to_string())));
}

#[tokio::test]
async fn zero_failstate_window_keeps_failures_until_cleared() {
    let control = ClockControl::new();
    let store = Store::builder::<u32, Item>(control.to_clock())
        .throttle(Duration::ZERO)
        .failstate_ttl(Duration::ZERO)
        .fetch_one(|_id: u32| async { Err::<Option<Item>, _>(Error::from_message("gone")) })
        .build()
        .unwrap();

    let entry = store.get_one(1);
    entry.ready().await;
    control.advance(Duration::from_secs(3600));

    assert!(entry.in_failstate());
    let _entry = store.get_one(1);
    assert!(!entry.is_pending());
}

#[tokio::test]
async fn builder_debug_lists_configuration() {
    let builder = Store::builder::<u32, Item>(Clock::new_frozen())
        .name("items")
        .fetch_one(fetch_one)
        .batch_size(7);

    let debug_str = format!("{builder:?}");
    assert!(debug_str.contains("StoreBuilder"));
    assert!(debug_str.contains("items"));
    assert!(debug_str.contains("batch_size: 7"));
    assert!(debug_str.contains("one: true"));
}
