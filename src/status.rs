//! Completion handles for background DAQ operations.
//!
//! An [`OperationStatus`] is returned immediately by non-blocking calls such
//! as `kickoff` and `complete`. The background task that does the work
//! resolves it exactly once, as either success or failure. Failures of
//! background work never surface as errors on another task; they are encoded
//! in the status.
//!
//! # Example
//!
//! ```rust,ignore
//! let status = daq.kickoff(RunArgs::events(120)).await?;
//! status.add_callback(|ok| tracing::info!(ok, "DAQ is acquiring"));
//! assert!(status.wait().await);
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{DaqError, DaqResult};

type Callback = Box<dyn FnOnce(bool) + Send>;

struct StatusInner {
    callbacks: Vec<Callback>,
}

/// Pending or resolved outcome of an asynchronous operation.
///
/// Cloning yields another handle to the same status.
#[derive(Clone)]
pub struct OperationStatus {
    label: &'static str,
    inner: Arc<Mutex<StatusInner>>,
    result: Arc<watch::Sender<Option<bool>>>,
}

impl OperationStatus {
    /// New pending status.
    pub fn new(label: &'static str) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            label,
            inner: Arc::new(Mutex::new(StatusInner {
                callbacks: Vec::new(),
            })),
            result: Arc::new(result),
        }
    }

    /// Status that is already resolved.
    pub fn finished(label: &'static str, success: bool) -> Self {
        let status = Self::new(label);
        status.set_finished(success);
        status
    }

    /// Resolve the status on a background task running `work`.
    ///
    /// Returns the pending status immediately.
    pub fn spawn<F>(label: &'static str, work: F) -> Self
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let status = Self::new(label);
        let handle = status.clone();
        tokio::spawn(async move {
            let success = work.await;
            handle.set_finished(success);
        });
        status
    }

    /// Resolve the status. Returns false if it was already resolved.
    pub fn set_finished(&self, success: bool) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            let first = self.result.send_if_modified(|result| {
                if result.is_some() {
                    return false;
                }
                *result = Some(success);
                true
            });
            if !first {
                warn!(status = self.label, success, "Status already resolved, ignoring");
                return false;
            }
            std::mem::take(&mut inner.callbacks)
        };
        debug!(status = self.label, success, "Status resolved");
        for callback in callbacks {
            callback(success);
        }
        true
    }

    /// Run `callback` once the status resolves (immediately if it already has).
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let success = {
            let mut inner = self.inner.lock();
            let current = *self.result.borrow();
            match current {
                Some(success) => success,
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(success);
    }

    /// True once resolved.
    pub fn done(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// `Some(success)` once resolved.
    pub fn success(&self) -> Option<bool> {
        *self.result.borrow()
    }

    /// Wait for resolution and return the success flag.
    pub async fn wait(&self) -> bool {
        let mut rx = self.result.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(result) => *result,
            // The sender lives as long as `self`, so this cannot close.
            Err(_) => None,
        };
        outcome.unwrap_or(false)
    }

    /// Wait at most `limit` for resolution.
    pub async fn wait_timeout(&self, limit: Duration) -> DaqResult<bool> {
        tokio::time::timeout(limit, self.wait())
            .await
            .map_err(|_| DaqError::Timeout {
                operation: self.label,
                timeout: limit,
            })
    }
}

impl fmt::Debug for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationStatus")
            .field("label", &self.label)
            .field("success", &self.success())
            .finish()
    }
}
