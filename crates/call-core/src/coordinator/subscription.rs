//! Scoped subscriptions
//!
//! A [`Subscription`] owns a spawned task that consumes some event source. It
//! is released exactly once: by [`Subscription::unsubscribe`] or, failing
//! that, when the guard is dropped.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Guard for a registered subscription
#[derive(Debug)]
pub struct Subscription {
    name: String,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl Subscription {
    /// Spawn `task` and tie it to a new guard.
    ///
    /// The future is raced against the guard's cancellation token; it also
    /// receives a child token for cooperative shutdown.
    pub fn spawn<F, Fut>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let future = task(token.child_token());

        let task_token = token.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            trace!("Subscription {} started", task_name);
            tokio::select! {
                _ = future => {
                    trace!("Subscription {} source finished", task_name);
                }
                _ = task_token.cancelled() => {
                    trace!("Subscription {} cancelled", task_name);
                }
            }
        });

        Self {
            name,
            token,
            task: Mutex::new(Some(handle)),
            released: AtomicBool::new(false),
        }
    }

    /// Forward every item of `source` into `sink` until unsubscribed
    pub fn forward<S, T>(name: impl Into<String>, source: S, sink: mpsc::UnboundedSender<T>) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
        T: Send + 'static,
    {
        Self::spawn(name, move |_token| async move {
            futures::pin_mut!(source);
            while let Some(item) = source.next().await {
                if sink.send(item).is_err() {
                    break;
                }
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the subscription. Returns `true` only for the call that released it.
    pub fn unsubscribe(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("Unsubscribing {}", self.name);
        self.token.cancel();
        true
    }

    /// Whether the subscription is still registered and its task running
    pub fn is_active(&self) -> bool {
        if self.released.load(Ordering::SeqCst) {
            return false;
        }
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for the subscription task to finish
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
