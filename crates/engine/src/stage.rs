//! Helpers shared by the upload and download stages.
//!
//! A worker only ever writes its record through [`StageContext::apply`] and
//! [`StageContext::progress`]. Both leave a paused or cancelling record
//! alone, and both treat a deleted record as a signal to stop.

use std::sync::Arc;

use driftbox_transfer::{
    CancelGuard, ContentSource, FileSource, TransferError, TransferId, TransferRecord,
};
use tracing::{debug, warn};

use crate::engine::Inner;
use crate::error::StoreError;

/// What happened to a worker write.
pub(crate) enum Step {
    Applied,
    /// The controller paused or cancelled the record; nothing was written.
    Held,
    /// The record was deleted; the worker's flag is now set.
    Gone,
    Rejected(StoreError),
}

/// Whether a stage hands over to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

pub(crate) struct StageContext<'a> {
    pub inner: &'a Inner,
    pub guard: &'a CancelGuard,
}

impl<'a> StageContext<'a> {
    pub fn new(inner: &'a Inner, guard: &'a CancelGuard) -> Self {
        Self { inner, guard }
    }

    pub fn id(&self) -> TransferId {
        self.guard.id()
    }

    pub fn cancelled(&self) -> bool {
        self.guard.is_cancelled()
    }

    /// Re-reads the record. A missing record sets the worker's own flag.
    pub fn record(&self) -> Option<TransferRecord> {
        match self.inner.store.get(self.id()) {
            Ok(Some(r)) => Some(r),
            Ok(None) => {
                debug!(id = %self.id(), "record deleted, stopping worker");
                self.guard.cancel_self();
                None
            }
            Err(e) => {
                warn!(id = %self.id(), error = %e, "failed to read record");
                None
            }
        }
    }

    /// Applies a worker change unless the controller owns the status.
    pub fn apply<F>(&self, mut f: F) -> Step
    where
        F: FnMut(&mut TransferRecord) -> Result<(), TransferError>,
    {
        let mut held = false;
        let result = self.inner.store.modify(self.id(), &mut |r| {
            if r.status().is_held_by_controller() {
                held = true;
                return Ok(false);
            }
            f(r)?;
            Ok(true)
        });
        match result {
            Ok(Some(_)) if held => {
                debug!(id = %self.id(), "status held by controller, worker update dropped");
                Step::Held
            }
            Ok(Some(r)) => {
                debug!(id = %r.id, status = %r.status(), "record updated");
                Step::Applied
            }
            Ok(None) => {
                debug!(id = %self.id(), "record deleted, stopping worker");
                self.guard.cancel_self();
                Step::Gone
            }
            Err(e) => {
                warn!(id = %self.id(), error = %e, "record update rejected");
                Step::Rejected(e)
            }
        }
    }

    /// Applies a change and reports whether the stage may go on.
    pub fn advance<F>(&self, f: F) -> Flow
    where
        F: FnMut(&mut TransferRecord) -> Result<(), TransferError>,
    {
        match self.apply(f) {
            Step::Applied => Flow::Continue,
            Step::Held | Step::Gone => Flow::Stop,
            Step::Rejected(e) => {
                self.fail(format!("internal state error: {e}"));
                Flow::Stop
            }
        }
    }

    /// Writes a progress percentage.
    ///
    /// Returns `false` if the record is gone and the worker should stop.
    pub fn progress(&self, percent: u8) -> bool {
        if self.cancelled() {
            return true;
        }
        let result = self.inner.store.modify(self.id(), &mut |r| {
            if r.status().is_held_by_controller() {
                return Ok(false);
            }
            Ok(r.record_progress(percent))
        });
        match result {
            Ok(Some(_)) => true,
            Ok(None) => {
                debug!(id = %self.id(), "record deleted during transfer");
                self.guard.cancel_self();
                false
            }
            Err(e) => {
                warn!(id = %self.id(), error = %e, "failed to write progress");
                true
            }
        }
    }

    /// Marks the attempt failed, unless the controller already owns the
    /// status or the worker was told to stop.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        if self.cancelled() {
            debug!(id = %self.id(), %message, "worker stopped, failure not recorded");
            return;
        }
        warn!(id = %self.id(), %message, "transfer failed");
        if let Step::Rejected(e) = self.apply(|r| r.fail(message.clone())) {
            warn!(id = %self.id(), error = %e, "could not record failure");
        }
    }

    /// The content source for an upload, re-created from the local path when
    /// the process restarted since the upload was requested.
    pub fn source(&self, record: &TransferRecord) -> Option<Arc<dyn ContentSource>> {
        let mut sources = self.inner.lock_sources();
        if let Some(source) = sources.get(&record.id) {
            return Some(Arc::clone(source));
        }
        if !record.local_path.is_file() {
            return None;
        }
        let source: Arc<dyn ContentSource> = Arc::new(FileSource::new(&record.local_path));
        sources.insert(record.id, Arc::clone(&source));
        Some(source)
    }
}
