//! An in-process document store.
//!
//! [`MemBackend`] keeps documents, the change log, indexes, local documents and users in
//! memory.  It follows CouchDB semantics where the sync core depends on them:
//!
//! - writes must carry the current revision, otherwise they fail with a conflict,
//! - deletions are tombstones,
//! - each document appears in the change log once, at the sequence of its latest write,
//! - replicated revisions are merged by picking the highest revision,
//! - `_local/` documents never show up in change feeds,
//! - selector queries without a covering index succeed with a warning, sorting without one
//!   fails.
//!
//! When users are configured the store behaves like a members-only remote database: every
//! document operation needs a session.  The store can also be switched offline, which
//! makes every operation fail with [`DatabaseError::Unreachable`] and ends live feeds.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use n0_future::boxed::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use super::{AdapterOptions, Backend, StoreAdapter, WriteOutcome};
use crate::{
    auth::{SessionInfo, UserDoc},
    changes::{ChangeEvent, ChangeFeed, ChangesOptions, FeedItem, FeedSender, Sequence, Since},
    document::{Document, Revision},
    error::{DatabaseError, Result},
    query::{FindQuery, FindResponse, IndexOutcome, IndexSpec, NO_INDEX_WARNING},
};

const EVENTS_CAP: usize = 1024;

/// Decides whether a write is accepted, returning the reason for refusing it.
pub type Validator = Arc<dyn Fn(&Document) -> Option<String> + Send + Sync>;

/// An in-process document store.
#[derive(Debug, Clone)]
pub struct MemBackend {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    name: String,
    state: Mutex<State>,
    events: broadcast::Sender<ChangeEvent>,
    offline: watch::Sender<bool>,
    #[debug("Validator")]
    validator: Mutex<Option<Validator>>,
    stats: Counters,
}

#[derive(Debug, Default)]
struct State {
    docs: BTreeMap<String, Stored>,
    by_seq: BTreeMap<u64, String>,
    seq: u64,
    local_docs: BTreeMap<String, Value>,
    indexes: Vec<IndexSpec>,
    users: BTreeMap<String, MemUser>,
    session: Option<SessionInfo>,
}

#[derive(Debug)]
struct Stored {
    doc: Document,
    seq: u64,
}

#[derive(derive_more::Debug)]
struct MemUser {
    #[debug("***")]
    password: String,
    doc: UserDoc,
}

#[derive(Debug, Default)]
struct Counters {
    finds: AtomicUsize,
    logins: AtomicUsize,
    session_checks: AtomicUsize,
    writes: AtomicUsize,
}

/// Operation counters of a [`MemBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemStats {
    /// Selector queries run.
    pub finds: usize,
    /// Login attempts, successful or not.
    pub logins: usize,
    /// Session lookups.
    pub session_checks: usize,
    /// Documents written, locally or by replication.
    pub writes: usize,
}

impl State {
    fn store(&mut self, doc: Document) -> ChangeEvent {
        self.seq += 1;
        let seq = self.seq;
        if let Some(old) = self.docs.get(&doc.id) {
            self.by_seq.remove(&old.seq);
        }
        self.by_seq.insert(seq, doc.id.clone());
        let event = ChangeEvent {
            id: doc.id.clone(),
            seq: Sequence::from(seq),
            deleted: doc.deleted,
            rev: doc.rev.clone(),
            doc: Some(doc.clone()),
        };
        self.docs.insert(doc.id.clone(), Stored { doc, seq });
        event
    }

    fn changes_after(&self, seq: u64) -> Vec<ChangeEvent> {
        self.by_seq
            .range(seq + 1..)
            .filter_map(|(seq, id)| {
                let stored = self.docs.get(id)?;
                Some(ChangeEvent {
                    id: id.clone(),
                    seq: Sequence::from(*seq),
                    deleted: stored.doc.deleted,
                    rev: stored.doc.rev.clone(),
                    doc: Some(stored.doc.clone()),
                })
            })
            .collect()
    }

    fn check_access(&self) -> Result<()> {
        if !self.users.is_empty() && self.session.is_none() {
            return Err(DatabaseError::unauthorized(
                "You are not authorized to access this db.",
            ));
        }
        Ok(())
    }

    fn has_usable_index(&self, query: &FindQuery) -> bool {
        let primary = IndexSpec::new(["_id"]);
        primary.covers(query) || self.indexes.iter().any(|index| index.covers(query))
    }
}

impl MemBackend {
    /// Creates an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAP);
        let (offline, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                events,
                offline,
                validator: Mutex::new(None),
                stats: Counters::default(),
            }),
        }
    }

    /// Adds a user, turning the store into a members-only store.
    pub fn with_user(self, name: &str, password: &str, roles: &[&str]) -> Self {
        self.add_user(name, password, roles);
        self
    }

    /// Adds or replaces a user.
    pub fn add_user(&self, name: &str, password: &str, roles: &[&str]) {
        let doc = UserDoc {
            name: name.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            fields: Default::default(),
        };
        self.inner.state.lock().expect("poisoned").users.insert(
            name.to_string(),
            MemUser {
                password: password.to_string(),
                doc,
            },
        );
    }

    /// Switches the store offline or back online.
    ///
    /// While offline every operation fails as unreachable and live feeds end.
    pub fn set_offline(&self, offline: bool) {
        debug!(name = %self.inner.name, offline, "switching store connectivity");
        self.inner.offline.send_replace(offline);
    }

    /// Whether the store is offline.
    pub fn is_offline(&self) -> bool {
        *self.inner.offline.borrow()
    }

    /// Drops the current session, as a server does once a session times out.
    pub fn expire_session(&self) {
        self.inner.state.lock().expect("poisoned").session = None;
    }

    /// Installs a validation function run on every write.
    pub fn set_validator(&self, validator: impl Fn(&Document) -> Option<String> + Send + Sync + 'static) {
        *self.inner.validator.lock().expect("poisoned") = Some(Arc::new(validator));
    }

    /// Removes the validation function.
    pub fn clear_validator(&self) {
        *self.inner.validator.lock().expect("poisoned") = None;
    }

    /// Operation counters.
    pub fn stats(&self) -> MemStats {
        let counters = &self.inner.stats;
        MemStats {
            finds: counters.finds.load(Ordering::Relaxed),
            logins: counters.logins.load(Ordering::Relaxed),
            session_checks: counters.session_checks.load(Ordering::Relaxed),
            writes: counters.writes.load(Ordering::Relaxed),
        }
    }

    /// Number of live, non-deleted documents.
    pub fn doc_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("poisoned")
            .docs
            .values()
            .filter(|stored| !stored.doc.deleted)
            .count()
    }

    /// The sequence of the latest write.
    pub fn update_seq(&self) -> Sequence {
        Sequence::from(self.inner.state.lock().expect("poisoned").seq)
    }

    fn check_online(&self) -> Result<()> {
        if self.is_offline() {
            return Err(DatabaseError::Unreachable {
                reason: format!("{} is offline", self.inner.name),
            });
        }
        Ok(())
    }

    fn validate_write(&self, doc: &Document) -> Option<String> {
        let validator = self.inner.validator.lock().expect("poisoned").clone();
        validator.and_then(|validate| validate(doc))
    }

    fn publish(&self, event: ChangeEvent) {
        self.inner.stats.writes.fetch_add(1, Ordering::Relaxed);
        trace!(name = %self.inner.name, id = %event.id, seq = %event.seq, "change");
        // no receivers is fine
        self.inner.events.send(event).ok();
    }

    fn get_sync(&self, id: &str) -> Result<Document> {
        self.check_online()?;
        let state = self.inner.state.lock().expect("poisoned");
        state.check_access()?;
        match state.docs.get(id) {
            Some(stored) if !stored.doc.deleted => Ok(stored.doc.clone()),
            Some(_) => Err(DatabaseError::not_found("deleted")),
            None => Err(DatabaseError::not_found("missing")),
        }
    }

    fn put_sync(&self, mut doc: Document) -> Result<Revision> {
        self.check_online()?;
        doc.validate()?;
        if doc.is_local() {
            let mut state = self.inner.state.lock().expect("poisoned");
            state.check_access()?;
            state.local_docs.insert(doc.id.clone(), doc.to_value());
            return Ok(Revision::new("0-1"));
        }
        if let Some(reason) = self.validate_write(&doc) {
            return Err(DatabaseError::forbidden(reason));
        }
        let mut state = self.inner.state.lock().expect("poisoned");
        state.check_access()?;
        let current = state.docs.get(&doc.id).map(|stored| &stored.doc);
        let accepted = match (current, &doc.rev) {
            (Some(current), Some(rev)) => current.rev.as_ref() == Some(rev),
            (Some(current), None) => current.deleted,
            (None, None) => true,
            (None, Some(_)) => false,
        };
        if !accepted {
            return Err(DatabaseError::conflict());
        }
        let prev = current.and_then(|current| current.rev.clone());
        let rev = Revision::next(prev.as_ref(), &doc);
        doc.rev = Some(rev.clone());
        let event = state.store(doc);
        self.publish(event);
        Ok(rev)
    }

    fn bulk_replicate_sync(&self, docs: Vec<Document>) -> Result<Vec<WriteOutcome>> {
        self.check_online()?;
        let mut outcomes = Vec::with_capacity(docs.len());
        let mut state = self.inner.state.lock().expect("poisoned");
        state.check_access()?;
        for doc in docs {
            let id = doc.id.clone();
            let Some(rev) = doc.rev.clone() else {
                outcomes.push(WriteOutcome::Denied {
                    id,
                    reason: "Replicated documents need a revision".to_string(),
                });
                continue;
            };
            if let Err(err) = doc.validate() {
                outcomes.push(WriteOutcome::Denied {
                    id,
                    reason: err.reason(),
                });
                continue;
            }
            if let Some(reason) = self.validate_write(&doc) {
                outcomes.push(WriteOutcome::Denied { id, reason });
                continue;
            }
            let wins = match state.docs.get(&id).and_then(|stored| stored.doc.rev.as_ref()) {
                Some(current) => rev > *current,
                None => true,
            };
            if !wins {
                outcomes.push(WriteOutcome::Skipped { id });
                continue;
            }
            let event = state.store(doc);
            self.publish(event);
            outcomes.push(WriteOutcome::Written { id });
        }
        Ok(outcomes)
    }

    fn find_sync(&self, query: FindQuery) -> Result<FindResponse> {
        self.check_online()?;
        query.selector.validate()?;
        self.inner.stats.finds.fetch_add(1, Ordering::Relaxed);
        let state = self.inner.state.lock().expect("poisoned");
        state.check_access()?;
        let indexed = state.has_usable_index(&query);
        if !query.sort.is_empty() && !indexed {
            return Err(DatabaseError::validation(
                "No index exists for this sort, try indexing by the sort fields.",
            ));
        }
        let mut docs: Vec<Document> = state
            .docs
            .values()
            .map(|stored| &stored.doc)
            .filter(|doc| !doc.deleted && !doc.is_design())
            .filter(|doc| query.selector.matches(doc))
            .cloned()
            .collect();
        drop(state);
        query.sort_documents(&mut docs);
        let docs = docs
            .into_iter()
            .skip(query.skip.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(FindResponse {
            docs,
            warning: (!indexed).then(|| NO_INDEX_WARNING.to_string()),
            bookmark: None,
        })
    }

    fn create_index_sync(&self, index: IndexSpec) -> Result<IndexOutcome> {
        self.check_online()?;
        if index.fields().is_empty() {
            return Err(DatabaseError::validation("Index fields must not be empty"));
        }
        let name = index.index_name();
        let ddoc = format!(
            "_design/{}",
            index.ddoc.clone().unwrap_or_else(|| name.clone())
        );
        let mut state = self.inner.state.lock().expect("poisoned");
        state.check_access()?;
        if state.indexes.iter().any(|known| known.fields() == index.fields()) {
            return Ok(IndexOutcome {
                result: "exists".to_string(),
                id: ddoc,
                name,
            });
        }
        let fields: serde_json::Map<String, Value> = index
            .fields()
            .iter()
            .map(|field| (field.clone(), json!("asc")))
            .collect();
        let mut design = Document::new(ddoc.clone())
            .with("language", "query")
            .with("views", json!({ name.clone(): {"map": {"fields": fields}}}));
        design.rev = state
            .docs
            .get(&ddoc)
            .and_then(|stored| stored.doc.rev.clone());
        design.rev = Some(Revision::next(design.rev.as_ref(), &design));
        state.indexes.push(index);
        let event = state.store(design);
        // under the lock, feeds skip sequences older than the last one they saw
        self.publish(event);
        drop(state);
        Ok(IndexOutcome {
            result: "created".to_string(),
            id: ddoc,
            name,
        })
    }

    fn open_feed(&self, options: ChangesOptions) -> Result<ChangeFeed> {
        self.check_online()?;
        self.inner.state.lock().expect("poisoned").check_access()?;
        let this = self.clone();
        Ok(ChangeFeed::spawn(move |tx| async move {
            this.run_feed(options, tx).await;
        }))
    }

    async fn run_feed(self, options: ChangesOptions, tx: FeedSender) {
        let mut offline = self.inner.offline.subscribe();
        let (backlog, mut events, mut last) = {
            let state = self.inner.state.lock().expect("poisoned");
            // subscribe while holding the lock so no write falls between backlog and live
            let events = self.inner.events.subscribe();
            let start = match &options.since {
                Since::Start => 0,
                Since::Now => state.seq,
                Since::Seq(seq) => seq.as_number().unwrap_or(0),
            };
            let backlog = match options.since {
                Since::Now => Vec::new(),
                _ => state.changes_after(start),
            };
            (backlog, events, start)
        };

        for event in backlog {
            last = event.seq.as_number().unwrap_or(last);
            if !self.send_change(&options, event, &tx).await {
                return;
            }
        }
        let caught_up = FeedItem::CaughtUp {
            last_seq: Sequence::from(last),
        };
        if tx.send(Ok(caught_up)).await.is_err() || !options.live {
            return;
        }

        loop {
            tokio::select! {
                res = offline.changed() => {
                    if res.is_err() || *offline.borrow() {
                        let err = DatabaseError::Unreachable {
                            reason: format!("{} went offline", self.inner.name),
                        };
                        tx.send(Err(err)).await.ok();
                        return;
                    }
                }
                event = events.recv() => {
                    let replay = match event {
                        Ok(event) => vec![event],
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "change feed lagged, replaying from log");
                            self.inner.state.lock().expect("poisoned").changes_after(last)
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    };
                    for event in replay {
                        let seq = event.seq.as_number().unwrap_or(0);
                        if seq <= last {
                            continue;
                        }
                        last = seq;
                        if !self.send_change(&options, event, &tx).await {
                            return;
                        }
                    }
                    if events.is_empty() {
                        let caught_up = FeedItem::CaughtUp { last_seq: Sequence::from(last) };
                        if tx.send(Ok(caught_up)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Sends a change if it passes the feed options, returns false once the feed is gone.
    async fn send_change(
        &self,
        options: &ChangesOptions,
        mut event: ChangeEvent,
        tx: &FeedSender,
    ) -> bool {
        if !options.accepts(&event) {
            return true;
        }
        if !options.include_docs {
            event.doc = None;
        }
        tx.send(Ok(FeedItem::Change(event))).await.is_ok()
    }

    fn login_sync(&self, username: &str, password: &str) -> Result<SessionInfo> {
        self.check_online()?;
        self.inner.stats.logins.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock().expect("poisoned");
        let Some(user) = state
            .users
            .get(username)
            .filter(|user| user.password == password)
        else {
            return Err(DatabaseError::unauthorized(
                "Name or password is incorrect.",
            ));
        };
        let info = SessionInfo {
            name: user.doc.name.clone(),
            roles: user.doc.roles.clone(),
        };
        state.session = Some(info.clone());
        Ok(info)
    }

    fn session_sync(&self) -> Result<Option<SessionInfo>> {
        self.check_online()?;
        self.inner
            .stats
            .session_checks
            .fetch_add(1, Ordering::Relaxed);
        Ok(self.inner.state.lock().expect("poisoned").session.clone())
    }

    fn logout_sync(&self) -> Result<()> {
        self.check_online()?;
        self.inner.state.lock().expect("poisoned").session = None;
        Ok(())
    }

    fn get_user_sync(&self, name: &str) -> Result<UserDoc> {
        self.check_online()?;
        let state = self.inner.state.lock().expect("poisoned");
        state.check_access()?;
        state
            .users
            .get(name)
            .map(|user| user.doc.clone())
            .ok_or_else(|| DatabaseError::not_found("missing"))
    }

    fn change_password_sync(&self, name: &str, password: &str) -> Result<()> {
        self.check_online()?;
        let mut state = self.inner.state.lock().expect("poisoned");
        if state.session.as_ref().map(|s| s.name.as_str()) != Some(name) {
            return Err(DatabaseError::forbidden(
                "Only the user can change their password.",
            ));
        }
        let user = state
            .users
            .get_mut(name)
            .ok_or_else(|| DatabaseError::not_found("missing"))?;
        user.password = password.to_string();
        // the server invalidates the session along with the old password
        state.session = None;
        Ok(())
    }

    fn read_checkpoint_sync(&self, id: &str) -> Result<Option<Sequence>> {
        self.check_online()?;
        let state = self.inner.state.lock().expect("poisoned");
        let seq = state
            .local_docs
            .get(&format!("_local/{id}"))
            .and_then(|doc| doc.get("last_seq"))
            .cloned()
            .and_then(|seq| serde_json::from_value(seq).ok());
        Ok(seq)
    }

    fn write_checkpoint_sync(&self, id: &str, seq: Sequence) -> Result<()> {
        self.check_online()?;
        let doc_id = format!("_local/{id}");
        let value = json!({ "_id": doc_id, "last_seq": seq });
        self.inner
            .state
            .lock()
            .expect("poisoned")
            .local_docs
            .insert(doc_id, value);
        Ok(())
    }

    fn destroy_sync(&self) -> Result<()> {
        let mut state = self.inner.state.lock().expect("poisoned");
        let users = std::mem::take(&mut state.users);
        *state = State {
            users,
            ..Default::default()
        };
        debug!(name = %self.inner.name, "destroyed store");
        Ok(())
    }
}

impl Backend for MemBackend {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn get(&self, id: String) -> BoxFuture<Result<Document>> {
        let res = self.get_sync(&id);
        Box::pin(async move { res })
    }

    fn put(&self, doc: Document) -> BoxFuture<Result<Revision>> {
        let res = self.put_sync(doc);
        Box::pin(async move { res })
    }

    fn bulk_replicate(&self, docs: Vec<Document>) -> BoxFuture<Result<Vec<WriteOutcome>>> {
        let res = self.bulk_replicate_sync(docs);
        Box::pin(async move { res })
    }

    fn find(&self, query: FindQuery) -> BoxFuture<Result<FindResponse>> {
        let res = self.find_sync(query);
        Box::pin(async move { res })
    }

    fn create_index(&self, index: IndexSpec) -> BoxFuture<Result<IndexOutcome>> {
        let res = self.create_index_sync(index);
        Box::pin(async move { res })
    }

    fn changes(&self, options: ChangesOptions) -> BoxFuture<Result<ChangeFeed>> {
        let res = self.open_feed(options);
        Box::pin(async move { res })
    }

    fn login(&self, username: String, password: String) -> BoxFuture<Result<SessionInfo>> {
        let res = self.login_sync(&username, &password);
        Box::pin(async move { res })
    }

    fn session(&self) -> BoxFuture<Result<Option<SessionInfo>>> {
        let res = self.session_sync();
        Box::pin(async move { res })
    }

    fn logout(&self) -> BoxFuture<Result<()>> {
        let res = self.logout_sync();
        Box::pin(async move { res })
    }

    fn get_user(&self, name: String) -> BoxFuture<Result<UserDoc>> {
        let res = self.get_user_sync(&name);
        Box::pin(async move { res })
    }

    fn change_password(&self, name: String, password: String) -> BoxFuture<Result<()>> {
        let res = self.change_password_sync(&name, &password);
        Box::pin(async move { res })
    }

    fn read_checkpoint(&self, id: String) -> BoxFuture<Result<Option<Sequence>>> {
        let res = self.read_checkpoint_sync(&id);
        Box::pin(async move { res })
    }

    fn write_checkpoint(&self, id: String, seq: Sequence) -> BoxFuture<Result<()>> {
        let res = self.write_checkpoint_sync(&id, seq);
        Box::pin(async move { res })
    }

    fn destroy(&self) -> BoxFuture<Result<()>> {
        let res = self.destroy_sync();
        Box::pin(async move { res })
    }
}

/// Opens [`MemBackend`]s from a process wide registry, so reopening a name returns the
/// same data.
#[derive(Debug, Clone, Default)]
pub struct MemAdapter {
    stores: Arc<Mutex<BTreeMap<String, MemBackend>>>,
}

impl MemAdapter {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an existing store under its name.
    pub fn insert(&self, backend: MemBackend) {
        self.stores
            .lock()
            .expect("poisoned")
            .insert(backend.name().to_string(), backend);
    }

    /// The store registered as `name`.
    pub fn get(&self, name: &str) -> Option<MemBackend> {
        self.stores.lock().expect("poisoned").get(name).cloned()
    }

    /// Names of all registered stores.
    pub fn names(&self) -> Vec<String> {
        self.stores.lock().expect("poisoned").keys().cloned().collect()
    }
}

impl StoreAdapter for MemAdapter {
    fn open(&self, name: &str, options: &AdapterOptions) -> BoxFuture<Result<Arc<dyn Backend>>> {
        let res = {
            let mut stores = self.stores.lock().expect("poisoned");
            match stores.get(name) {
                Some(backend) => Ok(Arc::new(backend.clone()) as Arc<dyn Backend>),
                None if options.skip_setup => {
                    Err(DatabaseError::not_found("Database does not exist."))
                }
                None => {
                    let backend = MemBackend::new(name);
                    stores.insert(name.to_string(), backend.clone());
                    Ok(Arc::new(backend) as Arc<dyn Backend>)
                }
            }
        };
        Box::pin(async move { res })
    }

    fn destroy(&self, name: &str) -> BoxFuture<Result<()>> {
        let removed = self.stores.lock().expect("poisoned").remove(name);
        let res = match removed {
            Some(backend) => backend.destroy_sync(),
            None => Ok(()),
        };
        Box::pin(async move { res })
    }
}

#[cfg(test)]
mod tests {
    use n0_future::time::{self, Duration};
    use n0_snafu::ResultExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::query::{Selector, SortField};

    fn member(id: &str, name: &str) -> Document {
        Document::new(id).with_type("member").with("name", name)
    }

    #[tokio::test]
    async fn put_requires_current_revision() -> n0_snafu::Result {
        let store = MemBackend::new("local");
        let mut doc = member("m1", "Ada");
        let first = store.put(doc.clone()).await?;
        doc.rev = Some(first.clone());
        let second = store.put(doc.clone()).await?;
        assert_eq!(second.generation(), 2);

        // stale revision
        doc.rev = Some(first);
        let err = store.put(doc.clone()).await.unwrap_err();
        assert!(err.is_conflict());

        // creating over an existing document
        let err = store.put(member("m1", "Bob")).await.unwrap_err();
        assert!(err.is_conflict());
        Ok(())
    }

    #[tokio::test]
    async fn racing_writers_on_same_revision() -> n0_snafu::Result {
        let store = MemBackend::new("local");
        let rev = store.put(member("m1", "Ada")).await?;
        let a = Document {
            rev: Some(rev.clone()),
            ..member("m1", "Ada A")
        };
        let b = Document {
            rev: Some(rev),
            ..member("m1", "Ada B")
        };
        let (ra, rb) = tokio::join!(store.put(a), store.put(b));
        assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
        let loser = ra.err().or(rb.err()).expect("one write fails");
        assert!(loser.is_conflict());
        Ok(())
    }

    #[tokio::test]
    async fn tombstones_and_recreate() -> n0_snafu::Result {
        let store = MemBackend::new("local");
        let rev = store.put(member("m1", "Ada")).await?;
        let tomb = Document {
            rev: Some(rev),
            ..member("m1", "Ada")
        }
        .tombstone();
        store.put(tomb).await?;
        assert!(store.get("m1".into()).await.unwrap_err().is_not_found());
        assert_eq!(store.doc_count(), 0);

        // recreating over a tombstone needs no revision
        let rev = store.put(member("m1", "Ada again")).await?;
        assert_eq!(rev.generation(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn changes_replay_latest_per_document() -> n0_snafu::Result {
        let store = MemBackend::new("local");
        let rev = store.put(member("m1", "Ada")).await?;
        store.put(member("m2", "Bob")).await?;
        store
            .put(Document {
                rev: Some(rev),
                ..member("m1", "Ada L.")
            })
            .await?;

        let mut feed = store.changes(ChangesOptions::default()).await?;
        let first = feed.next_change().await.expect("change")?;
        let second = feed.next_change().await.expect("change")?;
        assert_eq!(first.id, "m2");
        assert_eq!(second.id, "m1");
        assert_eq!(second.seq, Sequence::from(3));
        assert!(feed.next_change().await.is_none());

        let mut feed = store
            .changes(ChangesOptions::default().since(Since::Seq(Sequence::from(2))))
            .await?;
        assert_eq!(feed.next_change().await.expect("change")?.id, "m1");
        Ok(())
    }

    #[tokio::test]
    async fn live_feed_with_selector() -> n0_snafu::Result {
        let store = MemBackend::new("local");
        let mut feed = store
            .changes(ChangesOptions::live_since_now().selector(Selector::of_type("member")))
            .await?;
        // the initial catch up of a `since: now` feed is empty
        assert!(matches!(
            feed.next().await,
            Some(Ok(FeedItem::CaughtUp { .. }))
        ));

        store
            .put(Document::new("c1").with_type("contract"))
            .await?;
        store.put(member("m1", "Ada")).await?;
        let event = feed.next_change().await.expect("change")?;
        assert_eq!(event.id, "m1");
        assert_eq!(event.doc.expect("doc").body["name"], json!("Ada"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn design_docs_reach_live_feeds_among_writes() -> n0_snafu::Result {
        let store = MemBackend::new("local");
        let mut feed = store.changes(ChangesOptions::live_since_now()).await?;
        feed.next().await;

        let writer = store.clone();
        let writes = tokio::spawn(async move {
            for i in 0..50 {
                writer.put(member(&format!("m{i}"), "x")).await?;
            }
            Ok::<_, DatabaseError>(())
        });
        let indexer = store.clone();
        let index = tokio::spawn(async move {
            indexer.create_index(IndexSpec::new(["type", "name"])).await
        });
        writes.await.e()??;
        let outcome = index.await.e()??;

        let mut ids = Vec::new();
        while ids.len() < 51 {
            let event = time::timeout(Duration::from_secs(5), feed.next_change())
                .await
                .e()?
                .expect("change")?;
            ids.push(event.id);
        }
        assert!(ids.contains(&outcome.id));
        Ok(())
    }

    #[tokio::test]
    async fn offline_ends_live_feeds() -> n0_snafu::Result {
        let store = MemBackend::new("remote");
        let mut feed = store.changes(ChangesOptions::live_since_now()).await?;
        feed.next().await;
        store.set_offline(true);
        let err = feed.next().await.expect("error item").unwrap_err();
        assert!(err.is_network());
        assert!(store.get("x".into()).await.unwrap_err().is_network());
        Ok(())
    }

    #[tokio::test]
    async fn replicated_revisions_pick_winner() -> n0_snafu::Result {
        let store = MemBackend::new("local");
        let rev = store.put(member("m1", "Ada")).await?;
        let newer = Document {
            rev: Some(Revision::new("2-ffff")),
            ..member("m1", "Ada remote")
        };
        let older = Document {
            rev: Some(rev),
            ..member("m1", "Ada")
        };
        let outcomes = store.bulk_replicate(vec![newer, older]).await?;
        assert_eq!(
            outcomes,
            vec![
                WriteOutcome::Written { id: "m1".into() },
                WriteOutcome::Skipped { id: "m1".into() },
            ]
        );
        let doc = store.get("m1".into()).await?;
        assert_eq!(doc.body["name"], json!("Ada remote"));
        Ok(())
    }

    #[tokio::test]
    async fn find_index_rules() -> n0_snafu::Result {
        let store = MemBackend::new("local");
        store.put(member("m2", "Bob")).await?;
        store.put(member("m1", "Cyd")).await?;
        store.put(Document::new("c1").with_type("contract")).await?;

        let query = FindQuery::new(Selector::of_type("member"));
        let res = store.find(query.clone()).await?;
        assert_eq!(res.docs.len(), 2);
        assert_eq!(res.warning.as_deref(), Some(NO_INDEX_WARNING));

        let sorted = FindQuery::new(json!({"type": "member", "name": {"$gt": null}}))
            .sort(SortField::asc("name"));
        assert!(store.find(sorted.clone()).await.unwrap_err().status() == Some(400));

        let outcome = store.create_index(IndexSpec::new(["type", "name"])).await?;
        assert_eq!(outcome.result, "created");
        let outcome = store.create_index(IndexSpec::new(["type", "name"])).await?;
        assert_eq!(outcome.result, "exists");

        let res = store.find(sorted.limit(1)).await?;
        assert_eq!(res.warning, None);
        assert_eq!(res.docs.len(), 1);
        assert_eq!(res.docs[0].id, "m2");
        // the index lives in a design document, which queries never return
        assert!(store.get(outcome.id).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn members_only_store_needs_session() -> n0_snafu::Result {
        let store = MemBackend::new("assoc").with_user("alice", "secret", &["member"]);
        assert!(store.get("x".into()).await.unwrap_err().is_unauthorized());
        assert!(
            store
                .login("alice".into(), "wrong".into())
                .await
                .unwrap_err()
                .is_unauthorized()
        );
        let info = store.login("alice".into(), "secret".into()).await?;
        assert_eq!(info.roles, vec!["member".to_string()]);
        assert!(store.get("x".into()).await.unwrap_err().is_not_found());
        assert_eq!(store.session().await?, Some(info));
        store.expire_session();
        assert_eq!(store.session().await?, None);
        assert_eq!(store.stats().logins, 2);
        Ok(())
    }

    #[tokio::test]
    async fn checkpoints_are_local() -> n0_snafu::Result {
        let store = MemBackend::new("local");
        assert_eq!(store.read_checkpoint("rep".into()).await?, None);
        store
            .write_checkpoint("rep".into(), Sequence::from(7))
            .await?;
        assert_eq!(
            store.read_checkpoint("rep".into()).await?,
            Some(Sequence::from(7))
        );
        assert_eq!(store.update_seq(), Sequence::from(0));
        Ok(())
    }

    #[tokio::test]
    async fn adapter_reopens_same_store() -> n0_snafu::Result {
        let adapter = MemAdapter::new();
        let a = adapter.open("assoc-alice", &AdapterOptions::default()).await?;
        a.put(member("m1", "Ada")).await?;
        let b = adapter.open("assoc-alice", &AdapterOptions::default()).await?;
        assert!(b.get("m1".into()).await.is_ok());

        let missing = adapter
            .open("nope", &AdapterOptions { skip_setup: true })
            .await
            .unwrap_err();
        assert!(missing.is_not_found());

        adapter.destroy("assoc-alice").await?;
        let c = adapter.open("assoc-alice", &AdapterOptions::default()).await?;
        assert!(c.get("m1".into()).await.unwrap_err().is_not_found());
        Ok(())
    }
}
