// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A key-addressed async value cache with a coalescing fetch queue.
//!
//! Consumers ask a [`Store`] for individual keys, several keys, or the whole
//! collection. The store hands back [`Entry`] handles immediately and queues
//! the keys that need fetching. A background worker drains the queue after a
//! short throttle, so bursts of single-key reads collapse into one batch call:
//!
//! - each key is queued at most once while it waits;
//! - a full fetch request pre-empts partial batches;
//! - batches hold at most `batch_size` keys, in request order;
//! - values go stale after `ttl`, and failures suppress re-fetching for
//!   `failstate_ttl`.
//!
//! Fetching is delegated to caller-supplied async functions configured on the
//! [`StoreBuilder`]. Items returned by them identify their own key through the
//! [`Keyed`] trait.
//!
//! # Examples
//!
//! ```
//! use corral::{Error, Keyed, Store};
//! use tick::Clock;
//!
//! #[derive(Clone, Debug)]
//! struct Todo {
//!     id: String,
//!     title: String,
//! }
//!
//! impl Keyed<String> for Todo {
//!     fn key(&self) -> String {
//!         self.id.clone()
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::builder::<String, Todo>(Clock::new_tokio())
//!     .name("todos")
//!     .fetch_many(|ids: Vec<String>| async move {
//!         Ok::<_, Error>(
//!             ids.into_iter()
//!                 .map(|id| Todo { title: format!("todo {id}"), id })
//!                 .collect(),
//!         )
//!     })
//!     .build()?;
//!
//! let entries = store.get_many(["1".to_string(), "2".to_string()]);
//! store.settled().await;
//!
//! let titles: Vec<_> = entries.iter().filter_map(|entry| entry.peek()).map(|todo| todo.title).collect();
//! assert_eq!(titles, ["todo 1", "todo 2"]);
//! # Ok(())
//! # }
//! ```
//!
//! # Failures
//!
//! A failed fetch never surfaces from the read API. It is stored on the
//! affected entries, which then report [`Entry::in_failstate`] until the
//! failstate window lapses or [`Entry::clear_failstate`] is called:
//!
//! ```
//! use std::time::Duration;
//!
//! use corral::{Error, Store};
//! use tick::Clock;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::builder::<u32, (u32, String)>(Clock::new_tokio())
//!     .fetch_one(|id: u32| async move { Err::<Option<(u32, String)>, _>(Error::from_message(format!("no item {id}"))) })
//!     .failstate_ttl(Duration::from_secs(30))
//!     .build()?;
//!
//! let entry = store.get_one(7);
//! entry.ready().await;
//!
//! assert!(entry.in_failstate());
//! assert!(store.errors().contains_key(&7));
//! # Ok(())
//! # }
//! ```

mod builder;
mod drain;
mod entry;
mod error;
mod queue;
mod runtime;
mod store;
mod strategy;
mod telemetry;

pub use builder::{DEFAULT_BATCH_SIZE, DEFAULT_FAILSTATE_TTL, DEFAULT_NAME, DEFAULT_THROTTLE, StoreBuilder};
pub use entry::{Entry, EntryStatus, Expiry};
pub use error::{BuildError, Error, NotConfigured, Result};
pub use store::{Store, StoreStatus};
pub use strategy::Keyed;
