// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured log events for store activity.
//!
//! Every event carries the store name so that several stores sharing one
//! subscriber can be told apart. The crate never installs a subscriber itself.

use std::{fmt::Display, time::Duration};

use tick::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchOperation {
    One,
    Many,
    All,
}

impl FetchOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::One => "store.fetch_one",
            Self::Many => "store.fetch_many",
            Self::All => "store.fetch_all",
        }
    }

    /// The builder method that configures this operation.
    pub fn strategy(self) -> &'static str {
        match self {
            Self::One => "fetch_one",
            Self::Many => "fetch_many",
            Self::All => "fetch_all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreActivity {
    Fetched,
    Failed,
    NotConfigured,
}

impl StoreActivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetched => "store.fetched",
            Self::Failed => "store.failed",
            Self::NotConfigured => "store.not_configured",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::Fetched => Severity::Debug,
            Self::Failed => Severity::Warn,
            Self::NotConfigured => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Debug,
    Warn,
    Error,
}

/// Emits one `store.event` for a finished fetch.
pub(crate) fn record(
    store_name: &'static str,
    operation: FetchOperation,
    activity: StoreActivity,
    keys: usize,
    duration: Option<Duration>,
    error: Option<&dyn Display>,
) {
    let op = operation.as_str();
    let ev = activity.as_str();
    let duration_ns = duration.map(|d| d.as_nanos());
    let error = error.map(tracing::field::display);

    macro_rules! emit_event {
        ($level:ident) => {
            tracing::$level!(
                store.name = store_name,
                store.operation = op,
                store.activity = ev,
                store.keys = keys,
                store.duration_ns = ?duration_ns,
                store.error = error,
                "store.event"
            )
        };
    }

    match activity.severity() {
        Severity::Error => emit_event!(error),
        Severity::Warn => emit_event!(warn),
        Severity::Debug => emit_event!(debug),
    }
}

/// A queued key had no entry when its fetch started.
pub(crate) fn record_desync(store_name: &'static str, key: &dyn std::fmt::Debug) {
    tracing::warn!(store.name = store_name, store.key = ?key, "store.desync: creating missing entry for queued key");
}

/// A batch or full fetch returned an item for a key with no entry.
pub(crate) fn record_unknown_item(store_name: &'static str, key: &dyn std::fmt::Debug) {
    tracing::debug!(store.name = store_name, store.key = ?key, "store.unknown_item: ignoring fetched item");
}

/// Logs keys queued on behalf of a caller.
pub(crate) fn record_enqueued(store_name: &'static str, keys: usize) {
    tracing::trace!(store.name = store_name, store.keys = keys, "store.enqueued");
}

/// Result of a timed async operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timed<R> {
    pub result: R,
    pub duration: Duration,
}

/// Measures how long `f` takes on the store clock.
pub(crate) async fn timed<F, R>(clock: &Clock, f: F) -> Timed<R>
where
    F: Future<Output = R>,
{
    let start = clock.instant();
    let result = f.await;
    Timed {
        result,
        duration: clock.instant().saturating_duration_since(start),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{io, sync::Arc};

    use parking_lot::Mutex;
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt};

    /// Formatted events recorded on the current thread while its guard is alive.
    ///
    /// Current-thread tokio tests run the drain worker on the same thread, so
    /// its events land here too.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        pub(crate) fn install() -> (Self, DefaultGuard) {
            let logs = Self::default();
            let subscriber =
                tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_writer(logs.clone()).with_ansi(false));
            let guard = tracing::subscriber::set_default(subscriber);
            (logs, guard)
        }

        pub(crate) fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock()).lines().map(str::to_owned).collect()
        }

        /// The first event line mentioning `needle`.
        pub(crate) fn line_with(&self, needle: &str) -> String {
            let lines = self.lines();
            lines
                .iter()
                .find(|line| line.contains(needle))
                .cloned()
                .unwrap_or_else(|| panic!("no log line contains '{needle}', got:\n{}", lines.join("\n")))
        }
    }

    impl MakeWriter<'_> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&self) -> Self::Writer {
            self.clone()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
