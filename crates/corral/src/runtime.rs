// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runtime abstraction for the background drain worker.

use tokio::runtime::Handle;

use crate::BuildError;

/// Where store background work runs.
///
/// Captured once when the store is built, so the store can later be used
/// from threads that are not inside the runtime.
#[derive(Debug, Clone)]
pub(crate) struct Runtime {
    handle: Handle,
}

impl Runtime {
    /// Captures the tokio runtime the caller is running on.
    pub(crate) fn current() -> Result<Self, BuildError> {
        Handle::try_current()
            .map(|handle| Self { handle })
            .map_err(|e| BuildError::caused_by("a store must be built inside a tokio runtime", e))
    }

    pub(crate) fn spawn<T>(&self, work: T)
    where
        T: Future<Output = ()> + Send + 'static,
    {
        // Detached: the worker exits on its own once the store is dropped.
        drop(self.handle.spawn(work));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[test]
    fn current_fails_outside_a_runtime() {
        let error = Runtime::current().expect_err("no runtime is entered");
        assert!(error.to_string().contains("tokio runtime"));
    }

    #[tokio::test]
    async fn current_captures_the_running_runtime() {
        let runtime = Runtime::current().expect("inside #[tokio::test]");
        assert!(format!("{runtime:?}").contains("Runtime"));
    }

    #[tokio::test]
    async fn spawn_runs_work_in_the_background() {
        let runtime = Runtime::current().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let (tx, rx) = tokio::sync::oneshot::channel();

        runtime.spawn({
            let ran = Arc::clone(&ran);
            async move {
                ran.store(true, Ordering::SeqCst);
                let _ = tx.send(());
            }
        });

        rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
