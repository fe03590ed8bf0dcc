//! A task group whose jobs share one process-wide admission limit.
//!
//! [`AdmissionPool`] owns a [`Semaphore`] sized to the configured concurrency.
//! It is created once at startup and cloned into every request handler, so
//! the limit applies to the sum of all in-flight batches rather than to each
//! batch separately.
//!
//! Each batch opens a [`TaskGroup`] from the pool. Jobs are submitted one at a
//! time; `submit` waits for a free permit before spawning the job onto the
//! Tokio runtime, and the job holds the permit until it returns. The group
//! carries a child [`CancellationToken`] of the caller's token:
//!
//! - The first job error is recorded and cancels the token. Later errors are
//!   dropped.
//! - Once the token is cancelled, no further jobs are admitted.
//! - Running jobs observe the token at their own await points; nothing is
//!   forcibly terminated while the group is alive.
//!
//! [`TaskGroup::join`] waits for every admitted job and reports the first
//! error. Dropping a group without joining aborts its jobs, which releases
//! their permits.

use parhash_core::{Error, Result};
use parking_lot::Mutex;
use std::{future::Future, sync::Arc};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

/// Server-wide limit on concurrently running jobs.
#[derive(Clone, Debug)]
pub struct AdmissionPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionPool {
    /// Creates a pool admitting at most `capacity` concurrent jobs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `capacity` is zero or exceeds
    /// [`Semaphore::MAX_PERMITS`].
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid_config("concurrency must be greater than 0"));
        }
        if capacity > Semaphore::MAX_PERMITS {
            return Err(Error::invalid_config(format!(
                "concurrency {capacity} exceeds the maximum of {}",
                Semaphore::MAX_PERMITS
            )));
        }

        Ok(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Number of permits currently held by running jobs.
    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Opens a new group whose jobs are admitted through this pool and
    /// cancelled together with `parent`.
    pub fn group(&self, parent: &CancellationToken) -> TaskGroup {
        TaskGroup {
            permits: Arc::clone(&self.permits),
            cancel: parent.child_token(),
            jobs: JoinSet::new(),
            first_error: Arc::new(Mutex::new(None)),
            refused: false,
        }
    }
}

/// A dynamically growing set of fallible jobs sharing one cancellation token.
pub struct TaskGroup {
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    jobs: JoinSet<()>,
    first_error: Arc<Mutex<Option<Error>>>,
    refused: bool,
}

impl TaskGroup {
    /// Admits `job` once a permit is available and runs it on its own task.
    ///
    /// `job` is called only after a permit is granted and receives the
    /// group's cancellation token. Waiting for a permit is abandoned as soon
    /// as the group is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the group was cancelled before the job
    /// could be admitted. The job is not run in that case.
    pub async fn submit<F, Fut>(&mut self, job: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };

        let Some(permit) = permit else {
            self.refused = true;
            return Err(Error::Cancelled);
        };

        let cancel = self.cancel.clone();
        let first_error = Arc::clone(&self.first_error);
        let fut = job(cancel.clone());

        self.jobs.spawn(async move {
            let _permit = permit;
            if let Err(err) = fut.await {
                record_error(&first_error, &cancel, err);
            }
        });

        Ok(())
    }

    /// Waits for every admitted job to finish.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by a job. A job that panicked counts
    /// as [`Error::TaskFailed`]. If no job failed but admission was refused
    /// because of cancellation, returns [`Error::Cancelled`].
    pub async fn join(mut self) -> Result<()> {
        while let Some(joined) = self.jobs.join_next().await {
            if let Err(join_err) = joined {
                let context = if join_err.is_panic() {
                    "sub-task panicked".to_string()
                } else {
                    format!("sub-task aborted: {join_err}")
                };
                record_error(&self.first_error, &self.cancel, Error::TaskFailed { context });
            }
        }

        if let Some(err) = self.first_error.lock().take() {
            return Err(err);
        }
        if self.refused {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

fn record_error(slot: &Mutex<Option<Error>>, cancel: &CancellationToken, err: Error) {
    {
        let mut first = slot.lock();
        if first.is_none() {
            *first = Some(err);
        }
    }
    cancel.cancel();
}
