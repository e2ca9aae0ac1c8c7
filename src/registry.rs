//! Session registry: the only shared mutable state in the process.
//!
//! Maps a session token to the live progress channel of its subscriber plus
//! bookkeeping. Entries are inserted on subscribe and removed on subscriber
//! disconnect, terminal stream error, or a grace timer after completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::progress::ProgressEvent;

/// Per-session event buffer. Publishing is fire-and-forget: when the
/// subscriber falls this far behind, further frames are dropped rather than
/// blocking the producer.
pub const EVENT_BUFFER: usize = 64;

/// Upper bound on live sessions; at capacity the oldest entry is evicted so
/// the map cannot grow without limit.
pub const MAX_SESSIONS: usize = 1024;

/// How long a session outlives its `completed` frame before the registry
/// tears the channel down.
pub const COMPLETION_GRACE: Duration = Duration::from_secs(2);

const DECILE_UNSET: u8 = u8::MAX;

/// Live session entry. Mutated only through the registry and the publisher.
pub struct SessionHandle {
    tx: mpsc::Sender<ProgressEvent>,
    epoch: u64,
    created_at: Instant,
    last_progress: AtomicU8,
    last_logged_decile: AtomicU8,
}

impl SessionHandle {
    pub fn sender(&self) -> &mpsc::Sender<ProgressEvent> {
        &self.tx
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last observed percentage, 0–100, monotone.
    pub fn last_progress(&self) -> u8 {
        self.last_progress.load(Ordering::Relaxed)
    }

    pub(crate) fn record_progress(&self, progress: u8) {
        self.last_progress.fetch_max(progress, Ordering::Relaxed);
    }

    /// Returns true when `progress` crosses into a decile that has not been
    /// logged yet. Diagnostic throttling only; frame cadence is unaffected.
    pub(crate) fn crosses_decile(&self, progress: u8) -> bool {
        let decile = progress / 10;
        let last = self.last_logged_decile.load(Ordering::Relaxed);
        if last == DECILE_UNSET || decile > last {
            self.last_logged_decile.store(decile, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    next_epoch: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces the entry for `token`, returning the receiving
    /// end of its channel and the entry's epoch.
    ///
    /// A prior subscription for the same token is superseded: its sender is
    /// dropped here, and its own subscriber stream ends on its next poll.
    /// The returned epoch lets the caller close exactly the entry it opened
    /// (see [`close_if_current`](Self::close_if_current)).
    pub fn open(&self, token: &str) -> (mpsc::Receiver<ProgressEvent>, u64) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(SessionHandle {
            tx,
            epoch,
            created_at: Instant::now(),
            last_progress: AtomicU8::new(0),
            last_logged_decile: AtomicU8::new(DECILE_UNSET),
        });

        let mut sessions = self.sessions.write();
        if sessions.len() >= MAX_SESSIONS && !sessions.contains_key(token) {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, handle)| (handle.created_at, handle.epoch))
                .map(|(token, _)| token.clone());
            if let Some(evicted) = oldest {
                debug!(token = %evicted, "session registry full, evicting oldest entry");
                sessions.remove(&evicted);
            }
        }
        sessions.insert(token.to_string(), handle);
        (rx, epoch)
    }

    pub fn lookup(&self, token: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(token).cloned()
    }

    /// Removes the entry. Idempotent: closing an absent token is a no-op.
    pub fn close(&self, token: &str) {
        if self.sessions.write().remove(token).is_some() {
            debug!(token, "session closed");
        }
    }

    /// Removes the entry only if it still belongs to `epoch`. A superseding
    /// subscription therefore cancels stale disconnect guards and grace
    /// timers without any extra coordination.
    pub fn close_if_current(&self, token: &str, epoch: u64) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(token) {
            Some(handle) if handle.epoch == epoch => {
                sessions.remove(token);
                debug!(token, epoch, "session closed");
                true
            }
            _ => false,
        }
    }

    /// Schedules removal of the current entry for `token` after `delay`,
    /// used for the post-completion grace period. The timer is cancelled
    /// implicitly if the token is reopened in the meantime.
    pub fn close_after(self: &Arc<Self>, token: &str, delay: Duration) {
        let Some(handle) = self.lookup(token) else {
            return;
        };
        let epoch = handle.epoch;
        let registry = Arc::clone(self);
        let token = token.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.close_if_current(&token, epoch);
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = SessionRegistry::new();
        let (_rx, _) = registry.open("abc");
        registry.close("abc");
        registry.close("abc");
        registry.close("never-existed");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn second_open_supersedes_first() {
        let registry = SessionRegistry::new();
        let (mut rx1, _) = registry.open("abc");
        let (mut rx2, _) = registry.open("abc");
        assert_eq!(registry.len(), 1);

        let handle = registry.lookup("abc").unwrap();
        handle.sender().try_send(ProgressEvent::Completed).unwrap();

        // The superseded channel's sender was dropped on replacement.
        assert!(rx1.recv().await.is_none());
        assert_eq!(rx2.recv().await, Some(ProgressEvent::Completed));
    }

    #[tokio::test]
    async fn stale_epoch_close_leaves_new_entry_alone() {
        let registry = SessionRegistry::new();
        let (_rx1, old_epoch) = registry.open("abc");
        let (_rx2, new_epoch) = registry.open("abc");

        assert!(!registry.close_if_current("abc", old_epoch));
        assert_eq!(registry.len(), 1);
        assert!(registry.close_if_current("abc", new_epoch));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_timer_removes_entry() {
        let registry = Arc::new(SessionRegistry::new());
        let (_rx, _) = registry.open("abc");
        registry.close_after("abc", COMPLETION_GRACE);

        tokio::time::advance(COMPLETION_GRACE / 2).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.len(), 1);

        tokio::time::advance(COMPLETION_GRACE).await;
        tokio::task::yield_now().await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_cancels_pending_grace_timer() {
        let registry = Arc::new(SessionRegistry::new());
        let (_rx, _) = registry.open("abc");
        registry.close_after("abc", COMPLETION_GRACE);

        tokio::time::advance(Duration::from_millis(100)).await;
        let (_rx2, _) = registry.open("abc");

        tokio::time::advance(COMPLETION_GRACE * 2).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_oldest_entry() {
        let registry = SessionRegistry::new();
        let mut receivers = Vec::new();
        for i in 0..MAX_SESSIONS {
            receivers.push(registry.open(&format!("tok-{i}")));
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert_eq!(registry.len(), MAX_SESSIONS);

        let (_rx, _) = registry.open("one-more");
        assert_eq!(registry.len(), MAX_SESSIONS);
        assert!(registry.lookup("tok-0").is_none());
        assert!(registry.lookup("one-more").is_some());
    }

    #[tokio::test]
    async fn decile_marker_throttles_logging() {
        let registry = SessionRegistry::new();
        let (_rx, _) = registry.open("abc");
        let handle = registry.lookup("abc").unwrap();

        assert!(handle.crosses_decile(5));
        assert!(!handle.crosses_decile(9));
        assert!(handle.crosses_decile(10));
        assert!(!handle.crosses_decile(19));
        assert!(handle.crosses_decile(40));
        assert!(!handle.crosses_decile(40));
    }

    #[tokio::test]
    async fn last_progress_is_monotone() {
        let registry = SessionRegistry::new();
        let (_rx, _) = registry.open("abc");
        let handle = registry.lookup("abc").unwrap();

        handle.record_progress(30);
        handle.record_progress(10);
        assert_eq!(handle.last_progress(), 30);
        handle.record_progress(100);
        assert_eq!(handle.last_progress(), 100);
    }
}
