//! Replication state bridge.
//!
//! A replication session reports what it does through [`ReplicationEvent`]s.  The
//! [`SyncStateListener`] folds those events into a single observable [`SyncState`].
//!
//! Every call to [`SyncStateListener::listen`] starts a new session and tags it.  Only
//! events of the session with the current tag may change the observed state, so a slow
//! replication that was already superseded after a reconnect can not overwrite the state
//! of the fresh one.

use std::sync::{Arc, Mutex, Weak};

use n0_future::task::{self, AbortOnDropHandle};
use n0_watcher::{Direct, Watchable};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, trace};

use crate::error::ErrorInfo;

/// Replication status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// A session started or resumed.
    Active,
    /// Local changes are being sent.
    Pushing,
    /// Remote changes are being received.
    Pulling,
    /// Both sides are in sync, or the session waits to retry.
    Paused,
    /// No session is running.
    #[default]
    Complete,
}

/// The observed state of replication between a local and a remote store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Current status.
    pub status: SyncStatus,
    /// The error reported with the last transition, if any.
    pub error: Option<ErrorInfo>,
}

/// Direction of replicated changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    /// From the remote to the local store.
    Pull,
    /// From the local to the remote store.
    Push,
}

/// Events emitted by a replication session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// The session started or resumed work.
    Active,
    /// A batch of documents was written.
    Change {
        /// Where the documents went.
        direction: Direction,
        /// Number of documents written.
        docs_written: usize,
    },
    /// The session is idle, or waiting to retry after `error`.
    Paused {
        /// Set when the pause was caused by a failure.
        error: Option<ErrorInfo>,
    },
    /// The target refused a document.  Replication continues.
    Denied {
        /// Why the document was refused.
        error: ErrorInfo,
    },
    /// The session failed and was abandoned.
    Error {
        /// The failure.
        error: ErrorInfo,
    },
    /// The session ended.
    Complete,
}

impl SyncState {
    /// The state after `event`.
    pub fn apply(&self, event: &ReplicationEvent) -> SyncState {
        match event {
            ReplicationEvent::Active => SyncState {
                status: SyncStatus::Active,
                error: None,
            },
            ReplicationEvent::Change { direction, .. } => SyncState {
                status: match direction {
                    Direction::Pull => SyncStatus::Pulling,
                    Direction::Push => SyncStatus::Pushing,
                },
                error: None,
            },
            ReplicationEvent::Paused { error } => SyncState {
                status: SyncStatus::Paused,
                error: error.clone(),
            },
            ReplicationEvent::Denied { error } => SyncState {
                status: SyncStatus::Active,
                error: Some(error.clone()),
            },
            ReplicationEvent::Error { error } => SyncState {
                status: SyncStatus::Complete,
                error: Some(error.clone()),
            },
            ReplicationEvent::Complete => SyncState {
                status: SyncStatus::Complete,
                error: self.error.clone(),
            },
        }
    }
}

/// Folds the events of the current replication session into a [`SyncState`].
#[derive(Debug, Clone)]
pub struct SyncStateListener {
    inner: Arc<ListenerInner>,
}

#[derive(Debug)]
struct ListenerInner {
    state: Watchable<SyncState>,
    /// Tag of the current session, held while the state is updated.
    session: Mutex<u64>,
    debug: bool,
    task: Mutex<Option<AbortOnDropHandle<()>>>,
}

impl ListenerInner {
    /// Applies an event if it belongs to the session `tag`.
    fn apply(&self, tag: u64, event: &ReplicationEvent) -> bool {
        let session = self.session.lock().expect("poisoned");
        if *session != tag {
            return false;
        }
        let next = self.state.get().apply(event);
        if self.debug {
            info!(session = tag, status = %next.status, ?event, "sync event");
        } else {
            trace!(session = tag, status = %next.status, ?event, "sync event");
        }
        self.state.set(next).ok();
        drop(session);
        true
    }

    /// Starts a new session and returns to the initial state.
    fn bump(&self) -> u64 {
        let mut session = self.session.lock().expect("poisoned");
        *session += 1;
        self.state.set(SyncState::default()).ok();
        *session
    }
}

impl SyncStateListener {
    /// Creates a listener in the [`SyncStatus::Complete`] state.
    ///
    /// With `debug` set every applied event is logged at info level.
    pub fn new(debug: bool) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                state: Watchable::new(SyncState::default()),
                session: Mutex::new(0),
                debug,
                task: Mutex::new(None),
            }),
        }
    }

    /// Starts following a new replication session, superseding the previous one.
    ///
    /// Returns the tag of the new session.
    pub fn listen(&self, mut events: mpsc::Receiver<ReplicationEvent>) -> u64 {
        let tag = self.inner.bump();
        let inner: Weak<ListenerInner> = Arc::downgrade(&self.inner);
        let task = task::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    if !inner.apply(tag, &event) {
                        debug!(?event, "discarding event of superseded session");
                        break;
                    }
                }
            }
            .instrument(tracing::debug_span!("sync-state", session = tag)),
        );
        // replacing the handle aborts the previous session's task
        *self.inner.task.lock().expect("poisoned") = Some(AbortOnDropHandle::new(task));
        tag
    }

    /// Stops following the current session and returns to [`SyncStatus::Complete`].
    pub fn reset(&self) {
        self.inner.bump();
        self.inner.task.lock().expect("poisoned").take();
    }

    /// The current state.
    pub fn state(&self) -> SyncState {
        self.inner.state.get()
    }

    /// Watches the state.
    pub fn watch(&self) -> Direct<SyncState> {
        self.inner.state.watch()
    }
}
