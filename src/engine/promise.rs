//! Single-assignment completion cells.
//!
//! A [`Promise`] carries the eventual result of an in-flight stage
//! (provisioning, the prepare chain, isolation, the init reap, the
//! termination). It settles at most once, every waiter observes the
//! same value, and late subscribers see the settled value immediately,
//! which is what lets the destroy path await stage results that launch
//! started.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// A single-assignment cell observable by any number of waiters.
pub(crate) struct Promise<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settled = self.tx.borrow().is_some();
        f.debug_struct("Promise").field("settled", &settled).finish()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Creates an unsettled promise.
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Creates a promise already settled with `value`.
    pub(crate) fn resolved(value: T) -> Self {
        let promise = Self::new();
        let _ = promise.set(value);
        promise
    }

    /// Creates a promise settled by a spawned task running `future`.
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let promise = Self::new();
        let settle = promise.clone();
        tokio::spawn(async move {
            let value = future.await;
            settle.set(value);
        });
        promise
    }

    /// Settles the promise. The first call wins; later calls are
    /// ignored. Returns whether this call settled it.
    pub(crate) fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(value);
            true
        })
    }

    /// Returns the settled value, if any, without waiting.
    pub(crate) fn try_get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Waits until the promise settles and returns its value.
    pub(crate) async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            {
                let current = rx.borrow_and_update();
                if let Some(value) = current.as_ref() {
                    return value.clone();
                }
            }
            // The sender half lives inside self, so `changed` cannot
            // fail while this borrow is alive.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
