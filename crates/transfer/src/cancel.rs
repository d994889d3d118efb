use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TransferId;

/// Why a running transfer was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelIntent {
    /// Stop and keep the resumable checkpoint.
    Pause,
    /// Stop and discard the checkpoint and the record.
    Cancel,
}

/// Observable state of a transfer's cancellation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagState {
    /// No flag present: nothing is executing for this id.
    NotRunning,
    Active,
    Requested(CancelIntent),
}

struct Entry {
    token: CancellationToken,
    intent: Option<CancelIntent>,
    generation: u64,
}

type FlagMap = HashMap<TransferId, Entry>;

/// Concurrency-safe map from transfer id to its cancellation flag.
///
/// A flag exists exactly while a worker for that id is executing. Workers
/// hold a [`CancelGuard`]; dropping it removes the flag.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    flags: Arc<Mutex<FlagMap>>,
    generation: Arc<AtomicU64>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a flag for `id`.
    ///
    /// Returns `None` if a worker for `id` is already registered.
    pub fn register(&self, id: TransferId) -> Option<CancelGuard> {
        let mut flags = lock(&self.flags);
        if flags.contains_key(&id) {
            return None;
        }
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        flags.insert(
            id,
            Entry {
                token: token.clone(),
                intent: None,
                generation,
            },
        );
        debug!(%id, "cancellation flag registered");
        Some(CancelGuard {
            id,
            token,
            generation,
            flags: Arc::clone(&self.flags),
        })
    }

    /// Signals the worker for `id`.
    ///
    /// `Cancel` overrides an earlier `Pause`, never the reverse. Returns
    /// `true` if a worker was running and has been signalled.
    pub fn request(&self, id: TransferId, intent: CancelIntent) -> bool {
        let mut flags = lock(&self.flags);
        let Some(entry) = flags.get_mut(&id) else {
            return false;
        };
        entry.intent = match (entry.intent, intent) {
            (Some(CancelIntent::Cancel), _) => Some(CancelIntent::Cancel),
            (_, next) => Some(next),
        };
        entry.token.cancel();
        debug!(%id, ?intent, "cancellation requested");
        true
    }

    pub fn state(&self, id: TransferId) -> FlagState {
        let flags = lock(&self.flags);
        match flags.get(&id) {
            None => FlagState::NotRunning,
            Some(Entry { intent: None, .. }) => FlagState::Active,
            Some(Entry {
                intent: Some(intent),
                ..
            }) => FlagState::Requested(*intent),
        }
    }

    pub fn is_running(&self, id: TransferId) -> bool {
        lock(&self.flags).contains_key(&id)
    }

    /// Ids with a registered flag.
    pub fn running(&self) -> Vec<TransferId> {
        lock(&self.flags).keys().copied().collect()
    }
}

/// Ownership of a transfer's cancellation flag for the lifetime of a worker.
pub struct CancelGuard {
    id: TransferId,
    token: CancellationToken,
    generation: u64,
    flags: Arc<Mutex<FlagMap>>,
}

impl CancelGuard {
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Token to poll or await inside I/O loops.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The intent recorded by whoever cancelled this worker.
    pub fn intent(&self) -> Option<CancelIntent> {
        lock(&self.flags)
            .get(&self.id)
            .filter(|e| e.generation == self.generation)
            .and_then(|e| e.intent)
    }

    /// Sets this worker's own flag, e.g. after finding its record deleted.
    pub fn cancel_self(&self) {
        if let Some(entry) = lock(&self.flags).get_mut(&self.id)
            && entry.generation == self.generation
        {
            entry.intent = Some(CancelIntent::Cancel);
        }
        self.token.cancel();
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let mut flags = lock(&self.flags);
        if flags
            .get(&self.id)
            .is_some_and(|e| e.generation == self.generation)
        {
            flags.remove(&self.id);
            debug!(id = %self.id, "cancellation flag cleared");
        }
    }
}

fn lock(flags: &Mutex<FlagMap>) -> MutexGuard<'_, FlagMap> {
    // Every mutation is a single insert, remove or field store.
    flags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
