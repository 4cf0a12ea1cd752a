use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::error::FeedError;
use crate::types::DisplayRecord;

type RecordCallback = Arc<dyn Fn(&DisplayRecord) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&FeedError) + Send + Sync>;

/// Handle returned by a registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callback registries through which consumers observe store mutations.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    new_record: RwLock<Vec<(SubscriptionId, RecordCallback)>>,
    update: RwLock<Vec<(SubscriptionId, RecordCallback)>>,
    error: RwLock<Vec<(SubscriptionId, ErrorCallback)>>,
}

impl Subscribers {
    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_new_record(
        &self,
        callback: impl Fn(&DisplayRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        write(&self.new_record).push((id, Arc::new(callback)));
        id
    }

    pub fn on_update(
        &self,
        callback: impl Fn(&DisplayRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        write(&self.update).push((id, Arc::new(callback)));
        id
    }

    pub fn on_error(&self, callback: impl Fn(&FeedError) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id();
        write(&self.error).push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback from whichever registry holds it.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for registry in [&self.new_record, &self.update] {
            let mut callbacks = write(registry);
            let before = callbacks.len();
            callbacks.retain(|(sid, _)| *sid != id);
            removed |= callbacks.len() != before;
        }
        let mut callbacks = write(&self.error);
        let before = callbacks.len();
        callbacks.retain(|(sid, _)| *sid != id);
        removed | (callbacks.len() != before)
    }

    pub fn notify_new_record(&self, record: &DisplayRecord) {
        for callback in snapshot(&self.new_record) {
            guarded("new_record", || callback(record));
        }
    }

    pub fn notify_update(&self, record: &DisplayRecord) {
        for callback in snapshot(&self.update) {
            guarded("update", || callback(record));
        }
    }

    pub fn notify_error(&self, error: &FeedError) {
        for callback in snapshot(&self.error) {
            guarded("error", || callback(error));
        }
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// Callbacks run outside the lock so they may register or unsubscribe freely.
fn snapshot<C: Clone>(lock: &RwLock<Vec<(SubscriptionId, C)>>) -> Vec<C> {
    lock.read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, callback)| callback.clone())
        .collect()
}

fn guarded(channel: &str, call: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        warn!(channel, "subscriber callback panicked");
    }
}
