//! Bidirectional replication between a local and a remote store.
//!
//! A replication runs two workers, one per [`Direction`].  Each worker follows the change
//! feed of its source from the last checkpoint and writes the changed documents to its
//! target with [`Backend::bulk_replicate`], keeping their revisions.  Since the highest
//! revision wins and writing a known revision does nothing, documents written by one
//! direction come back through the other without being written again.
//!
//! Checkpoints are kept as `_local/` documents in the local store, so a restarted
//! replication resumes where the previous one stopped.
//!
//! The supervisor reports progress as [`ReplicationEvent`]s.  Transient failures pause the
//! replication and restart it after an exponential backoff, authorization failures end
//! it.

use std::{pin::pin, sync::Arc, time::Duration};

use backon::{Backoff, BackoffBuilder, ExponentialBuilder};
use data_encoding::HEXLOWER;
use n0_future::{
    task::{self, JoinHandle},
    time,
};
use ring::digest::{SHA256, digest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    backend::{Backend, WriteOutcome},
    changes::{ChangesOptions, FeedItem, Sequence, Since},
    document::Document,
    error::{DatabaseError, ErrorInfo, Result},
    handles::Cancelable,
    sync_state::{Direction, ReplicationEvent},
};

const EVENTS_CAP: usize = 64;

/// Options of a replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationOptions {
    /// Keep following both change feeds after catching up.
    pub live: bool,
    /// Restart after transient failures.
    pub retry: bool,
    /// Maximum number of documents written per batch.
    pub batch_size: usize,
    /// Backoff before the first restart.
    pub min_retry_delay: Duration,
    /// Upper bound of the restart backoff.
    pub max_retry_delay: Duration,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            live: true,
            retry: true,
            batch_size: 100,
            min_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

/// Whether a document may be pushed to the remote store.
///
/// Design and local documents are administrative and stay where they were written.
pub fn pushable(doc: &Document) -> bool {
    !doc.is_design() && !doc.is_local()
}

/// A running replication.
///
/// Dropping the handle cancels the replication.
#[derive(Debug)]
pub struct Replication {
    cancel: Cancelable,
    _task: JoinHandle<()>,
}

impl Replication {
    /// Requests the replication to stop.  It reports [`ReplicationEvent::Complete`]
    /// once stopped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the replication was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Replication {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts replicating between `local` and `remote`.
///
/// The replication stops when `cancel` is cancelled.  Its events are delivered on the
/// returned receiver.
pub(crate) fn replicate(
    local: Arc<dyn Backend>,
    remote: Arc<dyn Backend>,
    options: ReplicationOptions,
    cancel: Cancelable,
) -> (Replication, mpsc::Receiver<ReplicationEvent>) {
    let (events_tx, events_rx) = mpsc::channel(EVENTS_CAP);
    let span = error_span!("replication", local = %local.name(), remote = %remote.name());
    let supervisor = Supervisor {
        local,
        remote,
        options,
        token: cancel.token().clone(),
        events: events_tx,
    };
    let task = task::spawn(supervisor.run().instrument(span));
    (
        Replication {
            cancel,
            _task: task,
        },
        events_rx,
    )
}

/// Progress reported by a worker to the supervisor.
#[derive(Debug)]
enum Signal {
    Written(Direction, usize),
    Denied(ErrorInfo),
    CaughtUp(Direction),
}

#[derive(Debug)]
struct Supervisor {
    local: Arc<dyn Backend>,
    remote: Arc<dyn Backend>,
    options: ReplicationOptions,
    token: CancellationToken,
    events: mpsc::Sender<ReplicationEvent>,
}

/// Tracks whether both directions are caught up.
#[derive(Debug, Default)]
struct Progress {
    pull_idle: bool,
    push_idle: bool,
    paused: bool,
}

impl Supervisor {
    async fn run(self) {
        let mut backoff = self.build_backoff();
        self.emit(ReplicationEvent::Active).await;
        loop {
            let (signal_tx, mut signals) = mpsc::channel(EVENTS_CAP);
            let pull = self.run_worker(Direction::Pull, signal_tx.clone());
            let push = self.run_worker(Direction::Push, signal_tx);
            let mut workers = pin!(async move { tokio::try_join!(pull, push) });
            let mut progress = Progress::default();

            let res = loop {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        debug!("replication cancelled");
                        self.emit(ReplicationEvent::Complete).await;
                        return;
                    }
                    Some(signal) = signals.recv() => {
                        if matches!(signal, Signal::CaughtUp(_)) {
                            backoff = self.build_backoff();
                        }
                        self.handle_signal(signal, &mut progress).await;
                    }
                    res = &mut workers => break res,
                }
            };
            while let Ok(signal) = signals.try_recv() {
                self.handle_signal(signal, &mut progress).await;
            }

            let err = match res {
                Ok(_) => {
                    debug!("replication finished");
                    self.emit(ReplicationEvent::Complete).await;
                    return;
                }
                Err(err) => err,
            };
            let info = ErrorInfo::from(&err);
            if !self.options.retry || is_fatal(&err) {
                warn!("replication failed: {err:#}");
                self.emit(ReplicationEvent::Error { error: info }).await;
                return;
            }
            let Some(delay) = backoff.next() else {
                warn!("replication retries exceeded: {err:#}");
                self.emit(ReplicationEvent::Error { error: info }).await;
                return;
            };
            debug!("replication interrupted, retry in {delay:?}: {err:#}");
            self.emit(ReplicationEvent::Paused { error: Some(info) })
                .await;
            tokio::select! {
                _ = self.token.cancelled() => {
                    self.emit(ReplicationEvent::Complete).await;
                    return;
                }
                _ = time::sleep(delay) => {}
            }
            self.emit(ReplicationEvent::Active).await;
        }
    }

    fn build_backoff(&self) -> impl Backoff {
        ExponentialBuilder::new()
            .with_min_delay(self.options.min_retry_delay)
            .with_max_delay(self.options.max_retry_delay)
            .with_jitter()
            .without_max_times()
            .build()
    }

    async fn handle_signal(&self, signal: Signal, progress: &mut Progress) {
        match signal {
            Signal::Written(direction, docs_written) => {
                match direction {
                    Direction::Pull => progress.pull_idle = false,
                    Direction::Push => progress.push_idle = false,
                }
                if progress.paused {
                    progress.paused = false;
                    self.emit(ReplicationEvent::Active).await;
                }
                self.emit(ReplicationEvent::Change {
                    direction,
                    docs_written,
                })
                .await;
            }
            Signal::Denied(error) => {
                self.emit(ReplicationEvent::Denied { error }).await;
            }
            Signal::CaughtUp(direction) => {
                match direction {
                    Direction::Pull => progress.pull_idle = true,
                    Direction::Push => progress.push_idle = true,
                }
                if progress.pull_idle && progress.push_idle && !progress.paused {
                    progress.paused = true;
                    self.emit(ReplicationEvent::Paused { error: None }).await;
                }
            }
        }
    }

    async fn emit(&self, event: ReplicationEvent) {
        trace!(?event, "replication event");
        // nobody listening is fine
        self.events.send(event).await.ok();
    }

    /// Copies changes in one direction until the feed ends or fails.
    async fn run_worker(&self, direction: Direction, signals: mpsc::Sender<Signal>) -> Result<()> {
        let (source, target) = match direction {
            Direction::Pull => (&self.remote, &self.local),
            Direction::Push => (&self.local, &self.remote),
        };
        let checkpoint = checkpoint_id(direction, self.local.name(), self.remote.name());
        let since = match self.local.read_checkpoint(checkpoint.clone()).await? {
            Some(seq) => Since::Seq(seq),
            None => Since::Start,
        };
        trace!(%direction, since = since.as_param(), "starting worker");
        let options = ChangesOptions {
            since,
            live: self.options.live,
            include_docs: true,
            selector: None,
        };
        let mut feed = source.changes(options).await?;
        let mut batch = Vec::new();
        let mut written_seq: Option<Sequence> = None;

        while let Some(item) = feed.next().await {
            match item? {
                FeedItem::Change(event) => {
                    let Some(doc) = event.doc else {
                        continue;
                    };
                    if direction == Direction::Push && !pushable(&doc) {
                        continue;
                    }
                    batch.push(doc);
                    if batch.len() >= self.options.batch_size {
                        self.flush(direction, target, &mut batch, &signals).await?;
                    }
                }
                FeedItem::CaughtUp { last_seq } => {
                    self.flush(direction, target, &mut batch, &signals).await?;
                    if written_seq.as_ref() != Some(&last_seq) {
                        self.local
                            .write_checkpoint(checkpoint.clone(), last_seq.clone())
                            .await?;
                        written_seq = Some(last_seq);
                    }
                    signals.send(Signal::CaughtUp(direction)).await.ok();
                }
            }
        }
        if self.options.live {
            return Err(DatabaseError::Unreachable {
                reason: format!("{direction} change feed of {} ended", source.name()),
            });
        }
        Ok(())
    }

    async fn flush(
        &self,
        direction: Direction,
        target: &Arc<dyn Backend>,
        batch: &mut Vec<Document>,
        signals: &mpsc::Sender<Signal>,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let docs = std::mem::take(batch);
        let outcomes = target.bulk_replicate(docs).await?;
        let mut written = 0;
        for outcome in outcomes {
            match outcome {
                WriteOutcome::Written { .. } => written += 1,
                WriteOutcome::Skipped { .. } => {}
                WriteOutcome::Denied { id, reason } => {
                    debug!(%direction, %id, %reason, "document denied");
                    let error = ErrorInfo {
                        status: Some(403),
                        error: "forbidden".to_string(),
                        reason: format!("{id}: {reason}"),
                    };
                    signals.send(Signal::Denied(error)).await.ok();
                }
            }
        }
        if written > 0 {
            signals.send(Signal::Written(direction, written)).await.ok();
        }
        Ok(())
    }
}

/// Whether a failure ends a replication instead of pausing it.
fn is_fatal(err: &DatabaseError) -> bool {
    matches!(err.status(), Some(401) | Some(403) | Some(400))
}

/// Id of the checkpoint document of one direction of a replication.
fn checkpoint_id(direction: Direction, local: &str, remote: &str) -> String {
    let input = format!("{direction}\n{local}\n{remote}");
    let hash = digest(&SHA256, input.as_bytes());
    format!("sync-{}", HEXLOWER.encode(&hash.as_ref()[..16]))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        backend::mem::MemBackend, handles::HandleRegistry, sync_state::SyncStatus,
        sync_state::SyncState,
    };

    fn member(id: &str, name: &str) -> Document {
        Document::new(id).with_type("member").with("name", name)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ReplicationEvent>) -> ReplicationEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
            .expect("event")
    }

    /// Receives events until the replication pauses, returning the folded state.
    async fn until_paused(rx: &mut mpsc::Receiver<ReplicationEvent>) -> Vec<ReplicationEvent> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = matches!(event, ReplicationEvent::Paused { .. });
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn syncs_both_directions() -> n0_snafu::Result {
        let local = MemBackend::new("assoc-alice");
        let remote = MemBackend::new("assoc");
        local.put(member("m1", "Ada")).await?;
        remote.put(member("m2", "Bob")).await?;

        let registry = HandleRegistry::new();
        let (replication, mut events) = replicate(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            ReplicationOptions::default(),
            registry.register("replication"),
        );
        let seen = until_paused(&mut events).await;
        assert_eq!(seen.first(), Some(&ReplicationEvent::Active));
        let state = seen
            .iter()
            .fold(SyncState::default(), |state, event| state.apply(event));
        assert_eq!(state.status, SyncStatus::Paused);
        assert!(seen.contains(&ReplicationEvent::Change {
            direction: Direction::Pull,
            docs_written: 1
        }));
        assert!(seen.contains(&ReplicationEvent::Change {
            direction: Direction::Push,
            docs_written: 1
        }));
        assert_eq!(local.doc_count(), 2);
        assert_eq!(remote.doc_count(), 2);

        // a live write is pushed, then the replication pauses again
        local.put(member("m3", "Cyd")).await?;
        let seen = until_paused(&mut events).await;
        assert_eq!(seen[0], ReplicationEvent::Active);
        assert!(remote.get("m3".into()).await.is_ok());

        replication.cancel();
        assert_eq!(next_event(&mut events).await, ReplicationEvent::Complete);
        Ok(())
    }

    #[tokio::test]
    async fn design_documents_stay_local() -> n0_snafu::Result {
        let local = MemBackend::new("assoc-alice");
        let remote = MemBackend::new("assoc");
        local
            .create_index(crate::query::IndexSpec::new(["type", "name"]))
            .await?;
        local.put(member("m1", "Ada")).await?;

        let registry = HandleRegistry::new();
        let (_replication, mut events) = replicate(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            ReplicationOptions::default(),
            registry.register("replication"),
        );
        until_paused(&mut events).await;
        assert!(remote.get("m1".into()).await.is_ok());
        assert!(
            remote
                .get("_design/idx-type-name".into())
                .await
                .unwrap_err()
                .is_not_found()
        );
        Ok(())
    }

    #[tokio::test]
    async fn resumes_from_checkpoint() -> n0_snafu::Result {
        let local = MemBackend::new("assoc-alice");
        let remote = MemBackend::new("assoc");
        remote.put(member("m1", "Ada")).await?;
        let registry = HandleRegistry::new();
        let options = ReplicationOptions {
            live: false,
            ..Default::default()
        };

        let (_first, mut events) = replicate(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            options.clone(),
            registry.register("replication"),
        );
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        assert_eq!(seen.last(), Some(&ReplicationEvent::Complete));
        let writes = local.stats().writes;

        // nothing new on either side, so the second run writes nothing
        let (_second, mut events) = replicate(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            options,
            registry.register("replication"),
        );
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        assert!(
            !seen
                .iter()
                .any(|event| matches!(event, ReplicationEvent::Change { .. }))
        );
        assert_eq!(local.stats().writes, writes);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_and_retries_when_unreachable() -> n0_snafu::Result {
        let local = MemBackend::new("assoc-alice");
        let remote = MemBackend::new("assoc");
        let registry = HandleRegistry::new();
        let (_replication, mut events) = replicate(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            ReplicationOptions::default(),
            registry.register("replication"),
        );
        until_paused(&mut events).await;

        remote.set_offline(true);
        let event = next_event(&mut events).await;
        let ReplicationEvent::Paused { error: Some(error) } = event else {
            panic!("expected paused with error, got {event:?}");
        };
        assert!(error.is_network());

        remote.set_offline(false);
        remote.put(member("m9", "Zed")).await?;
        // the restart eventually pulls the new document
        loop {
            if let ReplicationEvent::Change {
                direction: Direction::Pull,
                ..
            } = next_event(&mut events).await
            {
                break;
            }
        }
        assert_eq!(local.get("m9".into()).await?.body["name"], json!("Zed"));
        Ok(())
    }

    #[tokio::test]
    async fn unauthorized_ends_replication() -> n0_snafu::Result {
        let local = MemBackend::new("assoc-alice");
        let remote = MemBackend::new("assoc").with_user("alice", "secret", &[]);
        let registry = HandleRegistry::new();
        let (_replication, mut events) = replicate(
            Arc::new(local),
            Arc::new(remote),
            ReplicationOptions::default(),
            registry.register("replication"),
        );
        assert_eq!(next_event(&mut events).await, ReplicationEvent::Active);
        let event = next_event(&mut events).await;
        let ReplicationEvent::Error { error } = event else {
            panic!("expected error, got {event:?}");
        };
        assert_eq!(error.status, Some(401));
        assert!(events.recv().await.is_none());
        Ok(())
    }

    #[test]
    fn checkpoint_ids_differ_per_direction() {
        let pull = checkpoint_id(Direction::Pull, "a", "b");
        let push = checkpoint_id(Direction::Push, "a", "b");
        assert_ne!(pull, push);
        assert!(pull.starts_with("sync-"));
        assert!(!pushable(&Document::new("_design/idx")));
        assert!(pushable(&Document::new("m1")));
    }
}
