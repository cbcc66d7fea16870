//! The document envelope handled by the sync core.
//!
//! Stores deal in untyped JSON documents.  At the core boundary a document is an
//! envelope of `{_id, _rev, _deleted, type}` plus an opaque body, so the core never needs
//! to know about the business schemas (members, contracts, seasons, ...) living in the
//! body.

use std::{borrow::Cow, cmp::Ordering, fmt};

use data_encoding::HEXLOWER;
use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DatabaseError, Result};

/// Id prefix of design documents, which are never pushed to the remote.
pub const DESIGN_PREFIX: &str = "_design/";

/// Id prefix of local documents, which never appear in change feeds.
pub const LOCAL_PREFIX: &str = "_local/";

/// Body members starting with `_` that are still accepted on write.
const ALLOWED_SPECIAL_MEMBERS: &[&str] = &["_attachments", "_conflicts", "_revisions"];

/// A revision token, `{generation}-{hash}`.
///
/// Every successful write assigns a new revision.  Revisions order by generation first and
/// hash second, which is also how the winning revision between concurrent writers is
/// picked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Wraps an existing revision string.
    pub fn new(rev: impl Into<String>) -> Self {
        Self(rev.into())
    }

    /// The revision string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The generation, i.e. the number of edits that led to this revision.
    ///
    /// Malformed revisions have generation `0`.
    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(generation, _)| generation.parse().ok())
            .unwrap_or(0)
    }

    fn hash(&self) -> &str {
        self.0.split_once('-').map(|(_, hash)| hash).unwrap_or("")
    }

    /// Computes the revision following `prev` for the given document content.
    pub(crate) fn next(prev: Option<&Revision>, doc: &Document) -> Self {
        let generation = prev.map(|rev| rev.generation()).unwrap_or(0) + 1;
        let mut input = Vec::new();
        if let Some(prev) = prev {
            input.extend_from_slice(prev.as_str().as_bytes());
        }
        input.push(doc.deleted as u8);
        input.extend_from_slice(doc.id.as_bytes());
        // serializing a map of json values can not fail
        if let Ok(body) = serde_json::to_vec(&doc.body) {
            input.extend_from_slice(&body);
        }
        let hash = digest(&SHA256, &input);
        Self(format!(
            "{generation}-{}",
            HEXLOWER.encode(&hash.as_ref()[..16])
        ))
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation()
            .cmp(&other.generation())
            .then_with(|| self.hash().cmp(other.hash()))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for Revision {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A document: identity, revision, type discriminator and an opaque body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier, assigned by the application.
    #[serde(rename = "_id")]
    pub id: String,
    /// Current revision, `None` for documents never written.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    /// Tombstone marker.
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Discriminator of the logical collection (`member`, `contract`, ...).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Everything else.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !value
}

impl Document {
    /// Creates an empty document with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Sets the type discriminator.
    pub fn with_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    /// Sets a body field.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(field.into(), value.into());
        self
    }

    /// Parses a document from a json value.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|err| DatabaseError::validation(err.to_string()))
    }

    /// The document as a json value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Whether this is a design document.
    pub fn is_design(&self) -> bool {
        self.id.starts_with(DESIGN_PREFIX)
    }

    /// Whether this is a local, never replicated document.
    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_PREFIX)
    }

    /// Looks up a field by dotted path, e.g. `address.city`.
    ///
    /// `_id`, `_rev`, `_deleted` and `type` resolve to the envelope fields.
    pub fn field(&self, path: &str) -> Option<Cow<'_, Value>> {
        match path {
            "_id" => return Some(Cow::Owned(Value::String(self.id.clone()))),
            "_rev" => {
                return self
                    .rev
                    .as_ref()
                    .map(|rev| Cow::Owned(Value::String(rev.to_string())));
            }
            "_deleted" => return Some(Cow::Owned(Value::Bool(self.deleted))),
            "type" => {
                return self
                    .doc_type
                    .as_ref()
                    .map(|t| Cow::Owned(Value::String(t.clone())));
            }
            _ => {}
        }
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.body.get(first)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(Cow::Borrowed(current))
    }

    /// The tombstone written when removing this document.
    ///
    /// The type discriminator is kept so that selector filtered change feeds see the
    /// deletion.
    pub fn tombstone(&self) -> Self {
        Self {
            id: self.id.clone(),
            rev: self.rev.clone(),
            deleted: true,
            doc_type: self.doc_type.clone(),
            body: Map::new(),
        }
    }

    /// Checks the document can be written.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(DatabaseError::validation("Document id must not be empty"));
        }
        if self.id.starts_with('_') && !self.is_design() && !self.is_local() {
            return Err(DatabaseError::validation(format!(
                "Only reserved document ids may start with underscore: {}",
                self.id
            )));
        }
        if let Some(key) = self
            .body
            .keys()
            .find(|key| key.starts_with('_') && !ALLOWED_SPECIAL_MEMBERS.contains(&key.as_str()))
        {
            return Err(DatabaseError::validation(format!(
                "Bad special document member: {key}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rev {
            Some(rev) => write!(f, "{}@{rev}", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}
