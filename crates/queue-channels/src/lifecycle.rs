//! Start/stop bookkeeping shared by consumers and publishers.

use crate::error::QueueError;
use std::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

struct Running<H> {
    handle: H,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Tracks the channel handle, cancellation token and loop tasks of one
/// started instance.
pub(crate) struct Lifecycle<H> {
    state: Mutex<Option<Running<H>>>,
}

impl<H: Clone> Lifecycle<H> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running<H>>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the running handle, or spawn a new set of loops.
    ///
    /// `spawn` receives a child of `parent` that cancels exactly the loops
    /// it starts.
    pub(crate) fn start<F>(&self, parent: &CancellationToken, spawn: F) -> H
    where
        F: FnOnce(CancellationToken) -> (H, Vec<JoinHandle<()>>),
    {
        let mut state = self.lock();
        if let Some(running) = state.as_ref() {
            if !running.cancel.is_cancelled() {
                return running.handle.clone();
            }
        }

        let cancel = parent.child_token();
        let (handle, tasks) = spawn(cancel.clone());
        *state = Some(Running {
            handle: handle.clone(),
            cancel,
            tasks,
        });
        handle
    }

    /// Signal the loops to stop. Safe to call repeatedly.
    pub(crate) fn stop(&self) -> Result<(), QueueError> {
        match self.lock().as_ref() {
            Some(running) => {
                running.cancel.cancel();
                Ok(())
            }
            None => Err(QueueError::NotStarted),
        }
    }

    /// Stop and wait for every loop task to finish.
    pub(crate) async fn shutdown(&self) -> Result<(), QueueError> {
        let tasks = {
            let mut state = self.lock();
            let running = state.as_mut().ok_or(QueueError::NotStarted)?;
            running.cancel.cancel();
            std::mem::take(&mut running.tasks)
        };

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Pipeline task ended abnormally");
            }
        }
        Ok(())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|running| !running.cancel.is_cancelled())
            .unwrap_or(false)
    }
}
