//! Change feeds.
//!
//! Every store keeps an ordered, append-only change log.  A [`ChangeFeed`] delivers the
//! entries of that log starting at a [`Since`] position, and keeps delivering new
//! entries while `live` is set.  Sequences are monotonic per store and replaying from a
//! given sequence is gapless.

use std::future::Future;

use n0_future::task::{self, AbortOnDropHandle};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    document::{Document, Revision},
    error::Result,
    handles::Cancelable,
    query::Selector,
};

const FEED_CHANNEL_CAP: usize = 64;

/// An opaque position in a store's change log.
///
/// CouchDB 1.x uses integers, later versions opaque strings.  Both are kept as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, derive_more::Display)]
#[serde(transparent)]
pub struct Sequence(String);

impl Sequence {
    /// Wraps a sequence string.
    pub fn new(seq: impl Into<String>) -> Self {
        Self(seq.into())
    }

    /// The sequence string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The numeric value, for stores using integer sequences.
    pub fn as_number(&self) -> Option<u64> {
        self.0
            .split_once('-')
            .map_or(self.0.as_str(), |(num, _)| num)
            .parse()
            .ok()
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for Sequence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(num) => Self::from(num),
            Raw::Text(text) => Self(text),
        })
    }
}

/// Where a change feed starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Since {
    /// From the beginning of the log.
    #[default]
    Start,
    /// Only changes written after the feed was opened.
    Now,
    /// Changes after the given sequence.
    Seq(Sequence),
}

impl Since {
    /// The value of the `since` parameter on the wire.
    pub fn as_param(&self) -> &str {
        match self {
            Since::Start => "0",
            Since::Now => "now",
            Since::Seq(seq) => seq.as_str(),
        }
    }
}

/// One entry of a change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Id of the changed document.
    pub id: String,
    /// Position of this change.
    pub seq: Sequence,
    /// Whether the change is a deletion.
    pub deleted: bool,
    /// The revision written.
    pub rev: Option<Revision>,
    /// The document at that revision, if documents were requested.
    pub doc: Option<Document>,
}

/// An item delivered by a [`ChangeFeed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    /// A change.
    Change(ChangeEvent),
    /// All changes known at this point were delivered.
    CaughtUp {
        /// Sequence of the last delivered change.
        last_seq: Sequence,
    },
}

/// Options of a change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesOptions {
    /// Start position.
    pub since: Since,
    /// Keep the feed open and deliver changes as they happen.
    pub live: bool,
    /// Attach documents to the events.
    pub include_docs: bool,
    /// Only deliver changes whose document matches, `filter: '_selector'` on the wire.
    pub selector: Option<Selector>,
}

impl ChangesOptions {
    /// A live feed of changes written from now on.
    pub fn live_since_now() -> Self {
        Self {
            since: Since::Now,
            live: true,
            include_docs: true,
            selector: None,
        }
    }

    /// Sets the start position.
    pub fn since(mut self, since: Since) -> Self {
        self.since = since;
        self
    }

    /// Restricts the feed to documents matching `selector`.
    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Whether the event passes the selector of this feed.
    pub(crate) fn accepts(&self, event: &ChangeEvent) -> bool {
        match (&self.selector, &event.doc) {
            (None, _) => true,
            (Some(selector), Some(doc)) => selector.matches(doc),
            (Some(_), None) => false,
        }
    }
}

/// Sending half handed to the producer of a [`ChangeFeed`].
pub(crate) type FeedSender = mpsc::Sender<Result<FeedItem>>;

/// A subscription to a store's change log.
///
/// The producer runs as a background task which is aborted when the feed is dropped.  A
/// feed opened through a [`Database`] is also registered with the store and ends when the
/// store is closed.
///
/// [`Database`]: crate::Database
#[derive(Debug)]
pub struct ChangeFeed {
    rx: mpsc::Receiver<Result<FeedItem>>,
    cancel: Option<Cancelable>,
    _task: AbortOnDropHandle<()>,
}

impl ChangeFeed {
    /// Runs `producer` in the background, feeding its items into a new feed.
    pub(crate) fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(FeedSender) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAP);
        let task = task::spawn(producer(tx).instrument(tracing::Span::current()));
        Self {
            rx,
            cancel: None,
            _task: AbortOnDropHandle::new(task),
        }
    }

    /// Ties the feed to a registered handle, ending it when the handle is cancelled.
    pub(crate) fn with_cancel(mut self, cancel: Cancelable) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Receives the next item.
    ///
    /// Returns `None` once the feed ended, either because the store stopped it or because
    /// it was cancelled.
    pub async fn next(&mut self) -> Option<Result<FeedItem>> {
        match &self.cancel {
            Some(cancel) => {
                let token = cancel.token();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    item = self.rx.recv() => item,
                }
            }
            None => self.rx.recv().await,
        }
    }

    /// Receives the next change, skipping catch-up markers.
    pub async fn next_change(&mut self) -> Option<Result<ChangeEvent>> {
        loop {
            match self.next().await? {
                Ok(FeedItem::Change(event)) => return Some(Ok(event)),
                Ok(FeedItem::CaughtUp { .. }) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_parsing() {
        let num: Sequence = serde_json::from_str("42").unwrap();
        assert_eq!(num.as_number(), Some(42));
        let text: Sequence = serde_json::from_str("\"17-g1AAAA\"").unwrap();
        assert_eq!(text.as_number(), Some(17));
        assert_eq!(Since::Seq(text).as_param(), "17-g1AAAA");
        assert_eq!(Since::Now.as_param(), "now");
    }

    #[tokio::test]
    async fn feed_ends_when_producer_ends() {
        let mut feed = ChangeFeed::spawn(|tx| async move {
            tx.send(Ok(FeedItem::CaughtUp {
                last_seq: Sequence::from(0),
            }))
            .await
            .ok();
        });
        assert!(matches!(
            feed.next().await,
            Some(Ok(FeedItem::CaughtUp { .. }))
        ));
        assert!(feed.next().await.is_none());
    }
}
