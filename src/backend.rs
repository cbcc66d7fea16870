//! Physical stores.
//!
//! A [`Backend`] is one physical document store, either kept in process ([`mem`]) or
//! reached over HTTP ([`http`]).  The sync core never implements storage itself: it
//! drives backends through this trait and overlays session, connectivity and replication
//! policy on top.
//!
//! Backends are opened by a [`StoreAdapter`].  Adapters are handed to the
//! [`DatabaseHelper`] once at startup, there is no global registration of capabilities.
//!
//! [`DatabaseHelper`]: crate::DatabaseHelper

use std::{fmt::Debug, sync::Arc};

use n0_future::boxed::BoxFuture;

use crate::{
    auth::{SessionInfo, UserDoc},
    changes::{ChangeFeed, ChangesOptions, Sequence},
    document::{Document, Revision},
    error::Result,
    query::{FindQuery, FindResponse, IndexOutcome, IndexSpec},
};

pub mod http;
pub mod mem;

/// Outcome of writing one replicated revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The revision became the winning revision.
    Written {
        /// Document id.
        id: String,
    },
    /// The store already had this or a winning revision.
    Skipped {
        /// Document id.
        id: String,
    },
    /// The store refused the document, e.g. through a validation function.
    Denied {
        /// Document id.
        id: String,
        /// Why the store refused.
        reason: String,
    },
}

/// One physical document store.
///
/// All operations return `'static` futures so backends can be used behind an
/// `Arc<dyn Backend>` from spawned tasks.
pub trait Backend: Send + Sync + Debug + 'static {
    /// Name of the store.
    fn name(&self) -> &str;

    /// Fetches the current revision of a document.
    fn get(&self, id: String) -> BoxFuture<Result<Document>>;

    /// Writes a document, returning the new revision.
    ///
    /// The revision of `doc` must be the current revision of the stored document, or
    /// `None` when creating it.
    fn put(&self, doc: Document) -> BoxFuture<Result<Revision>>;

    /// Writes revisions produced by another store, keeping their revision ids.
    ///
    /// The highest revision wins, writing an equal or lower revision does nothing.
    fn bulk_replicate(&self, docs: Vec<Document>) -> BoxFuture<Result<Vec<WriteOutcome>>>;

    /// Runs a selector query.
    fn find(&self, query: FindQuery) -> BoxFuture<Result<FindResponse>>;

    /// Creates an index, doing nothing if it exists.
    fn create_index(&self, index: IndexSpec) -> BoxFuture<Result<IndexOutcome>>;

    /// Opens a change feed.
    fn changes(&self, options: ChangesOptions) -> BoxFuture<Result<ChangeFeed>>;

    /// Starts a session.
    fn login(&self, username: String, password: String) -> BoxFuture<Result<SessionInfo>>;

    /// Looks up the live session, renewing it where the store supports that.
    fn session(&self) -> BoxFuture<Result<Option<SessionInfo>>>;

    /// Ends the session.
    fn logout(&self) -> BoxFuture<Result<()>>;

    /// Fetches a `_users` document.
    fn get_user(&self, name: String) -> BoxFuture<Result<UserDoc>>;

    /// Changes the password of a user.
    fn change_password(&self, name: String, password: String) -> BoxFuture<Result<()>>;

    /// Reads a replication checkpoint stored as a local document.
    fn read_checkpoint(&self, id: String) -> BoxFuture<Result<Option<Sequence>>>;

    /// Stores a replication checkpoint as a local document.
    fn write_checkpoint(&self, id: String, seq: Sequence) -> BoxFuture<Result<()>>;

    /// Deletes the store with all documents.
    fn destroy(&self) -> BoxFuture<Result<()>>;
}

/// Options an adapter opens a store with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterOptions {
    /// Skip the initial "create if missing" handshake.
    pub skip_setup: bool,
}

/// Opens physical stores by name.
pub trait StoreAdapter: Send + Sync + Debug + 'static {
    /// Opens, and creates if needed, the store `name`.
    fn open(&self, name: &str, options: &AdapterOptions) -> BoxFuture<Result<Arc<dyn Backend>>>;

    /// Deletes the store `name`.
    fn destroy(&self, name: &str) -> BoxFuture<Result<()>>;
}
