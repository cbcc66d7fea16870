//! The store wrapper.
//!
//! A [`Database`] is the one API the rest of the application uses against a physical
//! store, local or remote.  It normalizes failures into [`DatabaseError`]s, keeps the
//! session of the store alive, owns the change feeds, reactive queries and replication
//! running against the store, and cancels all of them on [`Database::close`].

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use n0_future::{
    task::{self, AbortOnDropHandle},
    time,
};
use n0_watcher::Direct;
use tracing::{Instrument, debug, info, trace, warn};

use crate::{
    auth::{SessionInfo, UserDoc},
    backend::Backend,
    changes::{ChangeFeed, ChangesOptions},
    document::{Document, Revision},
    error::{DatabaseError, Result},
    handles::{Cancelable, HandleRegistry},
    query::{FindQuery, FindResponse, IndexSpec},
    replication::{self, Replication, ReplicationOptions},
    sync_state::{SyncState, SyncStateListener},
};

pub mod live;

pub use self::live::LiveQuery;

/// Where a store lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StoreKind {
    /// On the device.
    Local,
    /// On the server.
    Remote,
}

/// Options a [`Database`] is opened with.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Where the store lives.
    pub kind: StoreKind,
    /// Limit applied to selector queries that do not set one.
    pub implicit_limit: Option<usize>,
    /// Server side session lifetime.  The session is renewed at half this interval.
    pub session_timeout: Duration,
    /// Log store events at info level.
    pub debug: bool,
    /// Options of replications started from this store.
    pub replication: ReplicationOptions,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            kind: StoreKind::Local,
            implicit_limit: None,
            session_timeout: Duration::from_secs(600),
            debug: false,
            replication: ReplicationOptions::default(),
        }
    }
}

/// One consistent API over one physical store.
///
/// Cloning is cheap and clones refer to the same store.  Two `Database`s compare equal
/// when they are clones of each other.
#[derive(Debug, Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    name: String,
    #[debug("{}", backend.name())]
    backend: Arc<dyn Backend>,
    options: DatabaseOptions,
    handles: Arc<HandleRegistry>,
    sync_state: SyncStateListener,
    replication: Mutex<Option<Replication>>,
    renewal: Mutex<Option<Renewal>>,
    session: Mutex<Option<SessionInfo>>,
    live: live::LiveCache,
    closed: AtomicBool,
}

/// Periodic session renewal, stopped on drop.
#[derive(Debug)]
struct Renewal {
    _cancel: Cancelable,
    _task: AbortOnDropHandle<()>,
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Database {}

impl Database {
    /// Wraps a physical store.
    pub fn new(backend: Arc<dyn Backend>, options: DatabaseOptions) -> Self {
        let name = backend.name().to_string();
        debug!(%name, kind = %options.kind, "opening store");
        Self {
            inner: Arc::new(Inner {
                name,
                backend,
                sync_state: SyncStateListener::new(options.debug),
                options,
                handles: HandleRegistry::new(),
                replication: Mutex::new(None),
                renewal: Mutex::new(None),
                session: Mutex::new(None),
                live: live::LiveCache::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Name of the store.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Where the store lives.
    pub fn kind(&self) -> StoreKind {
        self.inner.options.kind
    }

    /// The physical store.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// Whether [`Database::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DatabaseError::Closed {
                name: self.inner.name.clone(),
            });
        }
        Ok(())
    }

    /// Fetches a document.
    pub async fn get(&self, id: &str) -> Result<Document> {
        self.ensure_open()?;
        self.inner.backend.get(id.to_string()).await
    }

    /// Writes a document and stores the new revision in it.
    ///
    /// Fails with a conflict if the revision of `doc` is not the current one.
    pub async fn put(&self, doc: &mut Document) -> Result<Revision> {
        self.ensure_open()?;
        let rev = self.inner.backend.put(doc.clone()).await?;
        trace!(db = %self.inner.name, id = %doc.id, %rev, "put");
        doc.rev = Some(rev.clone());
        Ok(rev)
    }

    /// Deletes a document by writing a tombstone.
    pub async fn remove(&self, doc: &Document) -> Result<Revision> {
        self.ensure_open()?;
        let rev = self.inner.backend.put(doc.tombstone()).await?;
        trace!(db = %self.inner.name, id = %doc.id, %rev, "removed");
        Ok(rev)
    }

    /// Starts a session.
    ///
    /// Returns `false` if the credentials were rejected.  On success the session is
    /// renewed periodically for as long as the store is open.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<bool> {
        self.ensure_open()?;
        let info = match self
            .inner
            .backend
            .login(username.to_string(), password.to_string())
            .await
        {
            Ok(info) => info,
            Err(err) if err.is_unauthorized() => {
                debug!(db = %self.inner.name, %username, "credentials rejected");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        debug!(db = %self.inner.name, %username, "authenticated");
        *self.inner.session.lock().expect("poisoned") = Some(info);
        self.start_renewal();
        Ok(true)
    }

    fn start_renewal(&self) {
        let interval = self.inner.options.session_timeout / 2;
        let cancel = self.inner.handles.register("session-renewal");
        let token = cancel.token().clone();
        let backend = self.inner.backend.clone();
        let task = task::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = time::sleep(interval) => {}
                    }
                    match backend.session().await {
                        Ok(Some(info)) => trace!(name = %info.name, "session renewed"),
                        Ok(None) => warn!("session renewal found no session"),
                        Err(err) => warn!("session renewal failed: {err:#}"),
                    }
                }
            }
            .instrument(tracing::debug_span!("renewal", db = %self.inner.name)),
        );
        let renewal = Renewal {
            _cancel: cancel,
            _task: AbortOnDropHandle::new(task),
        };
        *self.inner.renewal.lock().expect("poisoned") = Some(renewal);
    }

    /// Ends the session and stops its renewal.
    ///
    /// Returns `false` if the server does not support logging out.
    pub async fn logout(&self) -> Result<bool> {
        self.inner.renewal.lock().expect("poisoned").take();
        self.inner.session.lock().expect("poisoned").take();
        match self.inner.backend.logout().await {
            Ok(()) => Ok(true),
            Err(err) if err.is_method_not_allowed() => {
                debug!(db = %self.inner.name, "server refused logout: {err:#}");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Looks up the live session on the store.
    pub async fn session(&self) -> Result<Option<SessionInfo>> {
        self.ensure_open()?;
        let session = self.inner.backend.session().await?;
        *self.inner.session.lock().expect("poisoned") = session.clone();
        Ok(session)
    }

    /// The session as of the last login or lookup.
    pub fn cached_session(&self) -> Option<SessionInfo> {
        self.inner.session.lock().expect("poisoned").clone()
    }

    /// Creates an index, doing nothing if it exists.
    pub async fn create_index(&self, index: IndexSpec) -> Result<Database> {
        self.ensure_open()?;
        let outcome = self.inner.backend.create_index(index).await?;
        debug!(db = %self.inner.name, name = %outcome.name, result = %outcome.result, "index");
        Ok(self.clone())
    }

    /// Runs a selector query.
    pub async fn find(&self, query: FindQuery) -> Result<FindResponse> {
        self.ensure_open()?;
        let query = self.with_implicit_limit(query);
        let res = self.inner.backend.find(query).await?;
        if let Some(warning) = &res.warning {
            debug!(db = %self.inner.name, %warning, "query without index");
        }
        Ok(res)
    }

    fn with_implicit_limit(&self, mut query: FindQuery) -> FindQuery {
        if query.limit.is_none() {
            query.limit = self.inner.options.implicit_limit;
        }
        query
    }

    /// Opens a change feed that ends when the store is closed.
    pub async fn changes(&self, options: ChangesOptions) -> Result<ChangeFeed> {
        self.ensure_open()?;
        let cancel = self.inner.handles.register("changes");
        let feed = self.inner.backend.changes(options).await?;
        Ok(feed.with_cancel(cancel))
    }

    /// Starts live bidirectional replication with `remote`, replacing any running one.
    ///
    /// Progress is reported through [`Database::sync_state`].
    pub fn replicate_with(&self, remote: &Database) -> Result<()> {
        self.ensure_open()?;
        remote.ensure_open()?;
        self.cancel_replication();
        let cancel = self.inner.handles.register("replication");
        let (replication, events) = replication::replicate(
            self.inner.backend.clone(),
            remote.inner.backend.clone(),
            self.inner.options.replication.clone(),
            cancel,
        );
        let session = self.inner.sync_state.listen(events);
        let msg = "replication started";
        if self.inner.options.debug {
            info!(local = %self.inner.name, remote = %remote.name(), session, "{msg}");
        } else {
            debug!(local = %self.inner.name, remote = %remote.name(), session, "{msg}");
        }
        *self.inner.replication.lock().expect("poisoned") = Some(replication);
        Ok(())
    }

    /// Stops the running replication, if any.
    pub fn cancel_replication(&self) -> bool {
        let replication = self.inner.replication.lock().expect("poisoned").take();
        match replication {
            Some(replication) => {
                debug!(db = %self.inner.name, "cancelling replication");
                replication.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a replication is running.
    pub fn is_replicating(&self) -> bool {
        self.inner
            .replication
            .lock()
            .expect("poisoned")
            .as_ref()
            .is_some_and(|replication| !replication.is_cancelled())
    }

    /// Watches the state of replication started from this store.
    pub fn sync_state(&self) -> Direct<SyncState> {
        self.inner.sync_state.watch()
    }

    /// The current state of replication started from this store.
    pub fn current_sync_state(&self) -> SyncState {
        self.inner.sync_state.state()
    }

    /// Fetches a `_users` document.
    pub async fn get_user(&self, name: &str) -> Result<UserDoc> {
        self.ensure_open()?;
        self.inner.backend.get_user(name.to_string()).await
    }

    /// Changes the password of `name` and logs in again with it.
    pub async fn change_password(&self, name: &str, password: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .backend
            .change_password(name.to_string(), password.to_string())
            .await?;
        if !self.authenticate(name, password).await? {
            return Err(DatabaseError::unauthorized(
                "Login with the new password failed",
            ));
        }
        Ok(())
    }

    /// Number of outstanding cancelable handles.
    pub fn open_handles(&self) -> usize {
        self.inner.handles.len()
    }

    /// Cancels all change feeds, reactive queries, replication and session renewal.
    ///
    /// Closing twice does nothing.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = self.inner.handles.cancel_all();
        self.inner.replication.lock().expect("poisoned").take();
        self.inner.renewal.lock().expect("poisoned").take();
        self.inner.sync_state.reset();
        self.inner.live.clear();
        debug!(db = %self.inner.name, cancelled, "closed store");
    }

    /// Closes the store and deletes it with all documents.
    pub async fn destroy(&self) -> Result<()> {
        self.close();
        self.inner.backend.destroy().await?;
        debug!(db = %self.inner.name, "destroyed store");
        Ok(())
    }
}
