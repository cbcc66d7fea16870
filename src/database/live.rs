//! Reactive queries.
//!
//! A reactive query merges a one-shot selector query with the live change feed of the
//! store.  The feed is opened `since: now` before the snapshot query runs, so no change
//! falls between the two: a change that the snapshot already contains is recognized by
//! its revision and ignored, a newer one replaces the snapshot entry.
//!
//! The merged collection of documents is shared per store and query.  Every subscriber
//! maps it through its own mapper, and a second subscription to the same query neither
//! re-runs the snapshot nor opens another feed.  New subscribers first receive the latest
//! collection.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
};

use n0_future::{
    Stream, StreamExt,
    boxed::BoxStream,
    task::{self, AbortOnDropHandle},
};
use n0_watcher::{Watchable, Watcher};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{Instrument, debug, info, trace, warn};

use super::Database;
use crate::{
    backend::Backend,
    changes::{ChangeEvent, ChangesOptions, FeedItem},
    document::Document,
    error::{DatabaseError, ErrorInfo},
    handles::Cancelable,
    query::FindQuery,
};

/// The merged result of a query, `None` until the snapshot arrived.
type Snapshot = Option<Result<Arc<Vec<Document>>, ErrorInfo>>;

/// One running query pipeline, shared by all its subscribers.
#[derive(Debug)]
struct SharedQuery {
    value: Watchable<Snapshot>,
    cancel: Cancelable,
    _task: AbortOnDropHandle<()>,
}

/// The running queries of a store by query key.
#[derive(Debug, Default)]
pub(super) struct LiveCache {
    queries: Mutex<HashMap<String, Weak<SharedQuery>>>,
}

impl LiveCache {
    pub(super) fn clear(&self) {
        self.queries.lock().expect("poisoned").clear();
    }
}

/// A stream of query results that follows the changes of the store.
///
/// The stream ends when the store is closed.  A failure of the snapshot query or the
/// change feed is delivered as an error item.
#[derive(derive_more::Debug)]
pub struct LiveQuery<T> {
    #[debug(skip)]
    stream: BoxStream<Result<T, ErrorInfo>>,
    #[debug(skip)]
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    _shared: Option<Arc<SharedQuery>>,
}

impl<T> LiveQuery<T> {
    fn failed(err: &DatabaseError) -> Self
    where
        T: Send + 'static,
    {
        Self {
            stream: Box::pin(n0_future::stream::once(Err(ErrorInfo::from(err)))),
            cancelled: None,
            _shared: None,
        }
    }
}

impl<T> Stream for LiveQuery<T> {
    type Item = Result<T, ErrorInfo>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(cancelled) = this.cancelled.as_mut() {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(None);
            }
        }
        this.stream.as_mut().poll_next(cx)
    }
}

impl Database {
    /// Follows the single document matching `query`.
    ///
    /// Emits `mapper` of the document while exactly one document matches, and
    /// `default()` when none or several do.
    pub fn find_one<T, M, D>(&self, query: FindQuery, mapper: M, default: D) -> LiveQuery<T>
    where
        T: Send + 'static,
        M: Fn(&Document) -> T + Send + 'static,
        D: Fn() -> T + Send + 'static,
    {
        self.live_query(query, move |docs| match docs {
            [doc] => mapper(doc),
            _ => default(),
        })
    }

    /// Follows the list of documents matching `query`.
    ///
    /// New documents are appended, or sorted in if the query has a sort.
    pub fn find_all<T, M>(&self, query: FindQuery, mapper: M) -> LiveQuery<Vec<T>>
    where
        T: Send + 'static,
        M: Fn(&Document) -> T + Send + 'static,
    {
        self.live_query(query, move |docs| docs.iter().map(&mapper).collect())
    }

    /// Follows the documents matching `query`, keyed by `key`.
    pub fn find_all_indexed<K, T, F, M>(
        &self,
        query: FindQuery,
        key: F,
        mapper: M,
    ) -> LiveQuery<BTreeMap<K, T>>
    where
        K: Ord + Send + 'static,
        T: Send + 'static,
        F: Fn(&Document) -> K + Send + 'static,
        M: Fn(&Document) -> T + Send + 'static,
    {
        self.live_query(query, move |docs| {
            docs.iter().map(|doc| (key(doc), mapper(doc))).collect()
        })
    }

    fn live_query<T, M>(&self, query: FindQuery, map: M) -> LiveQuery<T>
    where
        T: Send + 'static,
        M: Fn(&[Document]) -> T + Send + 'static,
    {
        if let Err(err) = self.ensure_open() {
            return LiveQuery::failed(&err);
        }
        let shared = self.shared_query(self.with_implicit_limit(query));
        let stream = shared
            .value
            .watch()
            .stream()
            .filter_map(|snapshot| snapshot)
            .map(move |res| res.map(|docs| map(&docs)));
        LiveQuery {
            stream: Box::pin(stream),
            cancelled: Some(Box::pin(shared.cancel.token().clone().cancelled_owned())),
            _shared: Some(shared),
        }
    }

    /// Returns the running pipeline for `query`, starting it if needed.
    fn shared_query(&self, query: FindQuery) -> Arc<SharedQuery> {
        let key = query.cache_key();
        let mut queries = self.inner.live.queries.lock().expect("poisoned");
        if let Some(shared) = queries.get(&key).and_then(Weak::upgrade) {
            if !shared.cancel.is_cancelled() {
                trace!(db = %self.inner.name, %key, "sharing live query");
                return shared;
            }
        }
        queries.retain(|_, shared| shared.strong_count() > 0);

        let cancel = self.inner.handles.register("live-query");
        let value = Watchable::new(None);
        let pipeline = Pipeline {
            backend: self.inner.backend.clone(),
            query,
            value: value.clone(),
            token: cancel.token().clone(),
            debug: self.inner.options.debug,
        };
        let span = tracing::debug_span!("live-query", db = %self.inner.name);
        let task = task::spawn(pipeline.run().instrument(span));
        let shared = Arc::new(SharedQuery {
            value,
            cancel,
            _task: AbortOnDropHandle::new(task),
        });
        queries.insert(key, Arc::downgrade(&shared));
        shared
    }
}

/// Produces the merged collection of one query.
struct Pipeline {
    backend: Arc<dyn Backend>,
    query: FindQuery,
    value: Watchable<Snapshot>,
    token: CancellationToken,
    debug: bool,
}

impl Pipeline {
    async fn run(self) {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => trace!("live query cancelled"),
            res = self.follow() => {
                if let Err(err) = res {
                    warn!("live query failed: {err:#}");
                    self.value.set(Some(Err(ErrorInfo::from(&err)))).ok();
                }
            }
        }
    }

    async fn follow(&self) -> Result<(), DatabaseError> {
        // filtering on the full selector would drop the changes that move a document out
        // of the result, `apply` does the matching
        let mut options = ChangesOptions::live_since_now();
        if let Some(filter) = self.query.selector.type_filter() {
            options = options.selector(filter);
        }
        let mut feed = self.backend.changes(options).await?;

        // the feed is established once it reports being caught up
        let mut pending = Vec::new();
        loop {
            match feed.next().await {
                Some(Ok(FeedItem::CaughtUp { .. })) => break,
                Some(Ok(FeedItem::Change(event))) => pending.push(event),
                Some(Err(err)) => return Err(err),
                None => return Ok(()),
            }
        }

        let mut docs = self.backend.find(self.query.clone()).await?.docs;
        for event in pending {
            self.apply(&mut docs, event);
        }
        self.publish(&docs);

        while let Some(item) = feed.next().await {
            match item? {
                FeedItem::Change(event) => {
                    if self.apply(&mut docs, event) {
                        self.publish(&docs);
                    }
                }
                FeedItem::CaughtUp { .. } => {}
            }
        }
        debug!("change feed ended");
        Ok(())
    }

    fn publish(&self, docs: &[Document]) {
        self.value.set(Some(Ok(Arc::new(docs.to_vec())))).ok();
    }

    /// Applies one change to the collection, returns whether it changed.
    fn apply(&self, docs: &mut Vec<Document>, event: ChangeEvent) -> bool {
        if self.debug {
            info!(id = %event.id, seq = %event.seq, deleted = event.deleted, "live change");
        } else {
            trace!(id = %event.id, seq = %event.seq, deleted = event.deleted, "live change");
        }
        let position = docs.iter().position(|doc| doc.id == event.id);
        let doc = match event.doc {
            Some(doc) if !event.deleted && self.query.selector.matches(&doc) => doc,
            _ => {
                let Some(position) = position else {
                    return false;
                };
                docs.remove(position);
                return true;
            }
        };
        match position {
            Some(position) => {
                if doc.rev <= docs[position].rev {
                    return false;
                }
                docs[position] = doc;
            }
            None => docs.push(doc),
        }
        if !self.query.sort.is_empty() {
            self.query.sort_documents(docs);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use n0_future::StreamExt;
    use n0_snafu::ResultExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tracing_test::traced_test;

    use crate::{
        Database, DatabaseOptions,
        backend::mem::MemBackend,
        document::Document,
        query::{FindQuery, IndexSpec, Selector, SortField},
    };

    fn member(id: &str, name: &str) -> Document {
        Document::new(id).with_type("member").with("name", name)
    }

    fn name(doc: &Document) -> String {
        doc.body["name"].as_str().unwrap_or_default().to_string()
    }

    fn open(backend: &MemBackend) -> Database {
        Database::new(Arc::new(backend.clone()), DatabaseOptions::default())
    }

    #[tokio::test]
    #[traced_test]
    async fn collection_appends_new_documents() -> n0_snafu::Result {
        let backend = MemBackend::new("assoc-alice");
        let db = open(&backend);
        db.put(&mut member("m1", "Ada")).await?;

        let mut members = db.find_all(FindQuery::new(Selector::of_type("member")), name);
        assert_eq!(members.next().await.expect("snapshot").e()?, vec!["Ada"]);

        db.put(&mut member("m2", "Bob")).await?;
        assert_eq!(members.next().await.expect("change").e()?, vec!["Ada", "Bob"]);

        // other types do not touch the collection
        db.put(&mut Document::new("c1").with_type("contract")).await?;
        let mut bob = db.get("m2").await?;
        bob.body.insert("name".into(), json!("Bobby"));
        db.put(&mut bob).await?;
        assert_eq!(members.next().await.expect("change").e()?, vec!["Ada", "Bobby"]);

        db.remove(&bob).await?;
        assert_eq!(members.next().await.expect("change").e()?, vec!["Ada"]);
        Ok(())
    }

    #[tokio::test]
    async fn collection_matches_fresh_query() -> n0_snafu::Result {
        let backend = MemBackend::new("assoc-alice");
        let db = open(&backend);
        let query = FindQuery::new(Selector::of_type("member"));
        let mut live = db.find_all(query.clone(), |doc| doc.id.clone());
        assert_eq!(live.next().await.expect("snapshot").e()?, Vec::<String>::new());

        let mut docs = Vec::new();
        for i in 0..10 {
            let mut doc = member(&format!("m{i}"), "x");
            db.put(&mut doc).await?;
            docs.push(doc);
        }
        for doc in docs.iter().step_by(3) {
            db.remove(doc).await?;
        }
        let mut expected: Vec<String> = db
            .find(query)
            .await?
            .docs
            .into_iter()
            .map(|doc| doc.id)
            .collect();
        expected.sort();
        loop {
            let mut current = live.next().await.expect("value").e()?;
            current.sort();
            if current == expected {
                break;
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn sorted_collection_stays_sorted() -> n0_snafu::Result {
        let db = open(&MemBackend::new("assoc-alice"));
        let db = db.create_index(IndexSpec::new(["type", "name"])).await?;
        db.put(&mut member("m1", "Cyd")).await?;
        let query = FindQuery::new(json!({"type": "member", "name": {"$gt": null}}))
            .sort(SortField::asc("name"));
        let mut live = db.find_all(query, name);
        assert_eq!(live.next().await.expect("snapshot").e()?, vec!["Cyd"]);
        db.put(&mut member("m2", "Ada")).await?;
        assert_eq!(live.next().await.expect("change").e()?, vec!["Ada", "Cyd"]);
        Ok(())
    }

    #[tokio::test]
    async fn find_one_falls_back_to_default() -> n0_snafu::Result {
        let db = open(&MemBackend::new("assoc-alice"));
        let mut season = db.find_one(
            FindQuery::new(json!({"type": "season", "current": true})),
            |doc| Some(doc.id.clone()),
            || None,
        );
        assert_eq!(season.next().await.expect("snapshot").e()?, None);

        let mut doc = Document::new("s1").with_type("season").with("current", true);
        db.put(&mut doc).await?;
        assert_eq!(season.next().await.expect("change").e()?, Some("s1".to_string()));

        // two matches are ambiguous
        db.put(&mut Document::new("s2").with_type("season").with("current", true))
            .await?;
        assert_eq!(season.next().await.expect("change").e()?, None);
        Ok(())
    }

    #[tokio::test]
    async fn documents_leaving_the_selector_are_dropped() -> n0_snafu::Result {
        let db = open(&MemBackend::new("assoc-alice"));
        let query = FindQuery::new(json!({"type": "season", "current": true}));
        let mut seasons = db.find_all(query.clone(), |doc| doc.id.clone());
        assert_eq!(seasons.next().await.expect("snapshot").e()?, Vec::<String>::new());

        let mut s1 = Document::new("s1").with_type("season").with("current", true);
        db.put(&mut s1).await?;
        assert_eq!(seasons.next().await.expect("change").e()?, vec!["s1"]);

        s1.body.insert("current".into(), json!(false));
        db.put(&mut s1).await?;
        assert_eq!(seasons.next().await.expect("change").e()?, Vec::<String>::new());
        assert!(db.find(query).await?.docs.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn removal_under_field_selector() -> n0_snafu::Result {
        let db = open(&MemBackend::new("assoc-alice"));
        let query = FindQuery::new(json!({"type": "season", "current": true}));
        let mut current = db.find_one(query.clone(), |doc| Some(doc.id.clone()), || None);
        assert_eq!(current.next().await.expect("snapshot").e()?, None);

        let mut s2 = Document::new("s2").with_type("season").with("current", true);
        db.put(&mut s2).await?;
        assert_eq!(current.next().await.expect("change").e()?, Some("s2".to_string()));

        db.remove(&s2).await?;
        assert_eq!(current.next().await.expect("change").e()?, None);
        assert!(db.find(query).await?.docs.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn indexed_collection() -> n0_snafu::Result {
        let db = open(&MemBackend::new("assoc-alice"));
        db.put(&mut member("m1", "Ada")).await?;
        let mut by_id = db.find_all_indexed(
            FindQuery::new(Selector::of_type("member")),
            |doc| doc.id.clone(),
            name,
        );
        let map = by_id.next().await.expect("snapshot").e()?;
        assert_eq!(map.get("m1").map(String::as_str), Some("Ada"));
        Ok(())
    }

    #[tokio::test]
    async fn second_subscription_shares_the_query() -> n0_snafu::Result {
        let backend = MemBackend::new("assoc-alice");
        let db = open(&backend);
        db.put(&mut member("m1", "Ada")).await?;
        let query = FindQuery::new(Selector::of_type("member"));

        let mut first = db.find_all(query.clone(), name);
        assert_eq!(first.next().await.expect("snapshot").e()?, vec!["Ada"]);
        let mut second = db.find_all(query.clone(), |doc| doc.id.clone());
        // the latest value is replayed to the new subscriber
        assert_eq!(second.next().await.expect("replay").e()?, vec!["m1"]);
        assert_eq!(backend.stats().finds, 1);
        assert_eq!(db.open_handles(), 1);

        drop(first);
        drop(second);
        let mut third = db.find_all(query, name);
        assert_eq!(third.next().await.expect("snapshot").e()?, vec!["Ada"]);
        assert_eq!(backend.stats().finds, 2);
        Ok(())
    }

    #[tokio::test]
    async fn closing_ends_queries() -> n0_snafu::Result {
        let db = open(&MemBackend::new("assoc-alice"));
        let mut members = db.find_all(FindQuery::new(Selector::of_type("member")), name);
        members.next().await.expect("snapshot").e()?;
        db.close();
        assert!(members.next().await.is_none());

        let mut late = db.find_all(FindQuery::new(Selector::of_type("member")), name);
        let err = late.next().await.expect("error").unwrap_err();
        assert_eq!(err.error, "closed");
        assert!(late.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn feed_failure_is_reported() -> n0_snafu::Result {
        let backend = MemBackend::new("assoc");
        let db = open(&backend);
        let mut members = db.find_all(FindQuery::new(Selector::of_type("member")), name);
        members.next().await.expect("snapshot").e()?;
        backend.set_offline(true);
        let err = members.next().await.expect("error").unwrap_err();
        assert!(err.is_network());
        Ok(())
    }
}
