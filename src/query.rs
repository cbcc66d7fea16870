//! Mango style selector queries.
//!
//! A [`FindQuery`] is a [`Selector`] plus optional sort, limit and skip.  Remote stores
//! evaluate the query server side, the in-process store and the reactive query engine
//! evaluate selectors with [`Selector::matches`].
//!
//! Supported operators: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`,
//! `$exists`, `$size`, `$all`, `$elemMatch`, `$and`, `$or`, `$nor` and `$not`.  Values
//! compare using CouchDB collation: `null < false < true < numbers < strings < arrays <
//! objects`.

use std::{borrow::Cow, cmp::Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer, ser::SerializeMap};
use serde_json::{Map, Value, json};

use crate::{
    document::Document,
    error::{DatabaseError, Result},
};

/// The warning returned for queries that no index covers.
pub const NO_INDEX_WARNING: &str =
    "No matching index found, create an index to optimize query time.";

const FIELD_OPERATORS: &[&str] = &[
    "$eq",
    "$ne",
    "$gt",
    "$gte",
    "$lt",
    "$lte",
    "$in",
    "$nin",
    "$exists",
    "$size",
    "$all",
    "$elemMatch",
    "$not",
];

/// A selector object, e.g. `{"type": "member", "age": {"$gt": 18}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector(Value);

impl Default for Selector {
    fn default() -> Self {
        Self(Value::Object(Map::new()))
    }
}

impl From<Value> for Selector {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl Selector {
    /// Creates a selector from a json object.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Selects all documents of a given `type`.
    pub fn of_type(doc_type: &str) -> Self {
        Self(json!({ "type": doc_type }))
    }

    /// The selector as json.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Checks the selector only uses supported operators.
    pub fn validate(&self) -> Result<()> {
        match &self.0 {
            Value::Object(map) => validate_combination(map),
            _ => Err(DatabaseError::validation("Selector must be a JSON object")),
        }
    }

    /// Whether the document matches this selector.
    ///
    /// Malformed selectors never match.
    pub fn matches(&self, doc: &Document) -> bool {
        match &self.0 {
            Value::Object(map) => match_combination(map, doc),
            _ => false,
        }
    }

    /// A selector on the `type` this selector requires, if it pins one.
    ///
    /// Tombstones keep their type, so a feed filtered this way still delivers removals.
    pub(crate) fn type_filter(&self) -> Option<Selector> {
        let doc_type = match self.0.get("type")? {
            Value::String(doc_type) => doc_type,
            Value::Object(op) if op.len() == 1 => op.get("$eq")?.as_str()?,
            _ => return None,
        };
        Some(Self::of_type(doc_type))
    }

    /// The fields constrained by this selector outside of `$or`/`$nor`/`$not`, used to
    /// pick an index.
    pub fn fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        if let Value::Object(map) = &self.0 {
            collect_fields(map, &mut fields);
        }
        fields
    }
}

fn collect_fields(map: &Map<String, Value>, fields: &mut Vec<String>) {
    for (key, value) in map {
        match key.as_str() {
            "$and" => {
                for item in value.as_array().into_iter().flatten() {
                    if let Value::Object(inner) = item {
                        collect_fields(inner, fields);
                    }
                }
            }
            key if key.starts_with('$') => {}
            key => {
                if !fields.iter().any(|f| f == key) {
                    fields.push(key.to_string());
                }
            }
        }
    }
}

fn validate_combination(map: &Map<String, Value>) -> Result<()> {
    for (key, value) in map {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let items = value.as_array().ok_or_else(|| {
                    DatabaseError::validation(format!("{key} requires an array argument"))
                })?;
                for item in items {
                    let inner = item.as_object().ok_or_else(|| {
                        DatabaseError::validation(format!("{key} arguments must be objects"))
                    })?;
                    validate_combination(inner)?;
                }
            }
            "$not" => {
                let inner = value
                    .as_object()
                    .ok_or_else(|| DatabaseError::validation("$not requires an object"))?;
                validate_combination(inner)?;
            }
            key if key.starts_with('$') => {
                return Err(DatabaseError::validation(format!(
                    "Invalid operator: {key}"
                )));
            }
            _ => validate_condition(value)?,
        }
    }
    Ok(())
}

fn validate_condition(value: &Value) -> Result<()> {
    let Value::Object(map) = value else {
        return Ok(());
    };
    for (op, arg) in map {
        if !op.starts_with('$') {
            // nested field selector
            return validate_combination(map);
        }
        if !FIELD_OPERATORS.contains(&op.as_str()) {
            return Err(DatabaseError::validation(format!("Invalid operator: {op}")));
        }
        match op.as_str() {
            "$in" | "$nin" | "$all" if !arg.is_array() => {
                return Err(DatabaseError::validation(format!(
                    "{op} requires an array argument"
                )));
            }
            "$exists" if !arg.is_boolean() => {
                return Err(DatabaseError::validation("$exists requires a boolean"));
            }
            "$size" if !arg.is_u64() => {
                return Err(DatabaseError::validation("$size requires an integer"));
            }
            "$elemMatch" => validate_condition(arg)?,
            "$not" => validate_condition(arg)?,
            _ => {}
        }
    }
    Ok(())
}

fn match_combination(map: &Map<String, Value>, doc: &Document) -> bool {
    map.iter().all(|(key, value)| match key.as_str() {
        "$and" => value
            .as_array()
            .is_some_and(|items| items.iter().all(|item| match_object(item, doc))),
        "$or" => value
            .as_array()
            .is_some_and(|items| items.iter().any(|item| match_object(item, doc))),
        "$nor" => value
            .as_array()
            .is_some_and(|items| !items.iter().any(|item| match_object(item, doc))),
        "$not" => !match_object(value, doc),
        key if key.starts_with('$') => false,
        field => match_condition(doc.field(field).as_deref(), value, Some((field, doc))),
    })
}

fn match_object(value: &Value, doc: &Document) -> bool {
    value
        .as_object()
        .is_some_and(|inner| match_combination(inner, doc))
}

/// Matches one field value against a condition.
///
/// `scope` is the field path and document, used to resolve nested field selectors like
/// `{"address": {"city": "Lyon"}}`.
fn match_condition(field: Option<&Value>, cond: &Value, scope: Option<(&str, &Document)>) -> bool {
    let Value::Object(ops) = cond else {
        return field.is_some_and(|value| value == cond);
    };
    if !ops.keys().all(|op| op.starts_with('$')) {
        return match scope {
            Some((path, doc)) => ops.iter().all(|(sub, sub_cond)| {
                let nested = format!("{path}.{sub}");
                match_condition(
                    doc.field(&nested).as_deref(),
                    sub_cond,
                    Some((&nested, doc)),
                )
            }),
            None => field.is_some_and(|value| value == cond),
        };
    }
    ops.iter()
        .all(|(op, arg)| match_operator(field, op, arg, scope))
}

fn match_operator(
    field: Option<&Value>,
    op: &str,
    arg: &Value,
    scope: Option<(&str, &Document)>,
) -> bool {
    if op == "$exists" {
        return arg.as_bool().is_some_and(|want| want == field.is_some());
    }
    if op == "$not" {
        return !match_condition(field, arg, scope);
    }
    let Some(value) = field else {
        return false;
    };
    match op {
        "$eq" => value == arg,
        "$ne" => value != arg,
        "$gt" => collate(value, arg) == Ordering::Greater,
        "$gte" => collate(value, arg) != Ordering::Less,
        "$lt" => collate(value, arg) == Ordering::Less,
        "$lte" => collate(value, arg) != Ordering::Greater,
        "$in" => arg
            .as_array()
            .is_some_and(|items| items.iter().any(|item| item == value)),
        "$nin" => arg
            .as_array()
            .is_some_and(|items| !items.iter().any(|item| item == value)),
        "$size" => match (value, arg.as_u64()) {
            (Value::Array(items), Some(size)) => items.len() as u64 == size,
            _ => false,
        },
        "$all" => match (value, arg) {
            (Value::Array(items), Value::Array(wanted)) => {
                wanted.iter().all(|want| items.contains(want))
            }
            _ => false,
        },
        "$elemMatch" => match value {
            Value::Array(items) => items
                .iter()
                .any(|item| match_condition(Some(item), arg, None)),
            _ => false,
        },
        _ => false,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// Compares two json values using CouchDB view collation.
pub fn collate(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(x, y)| collate(x, y))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y)
            .map(|((kx, vx), (ky, vy))| kx.cmp(ky).then_with(|| collate(vx, vy)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => Ordering::Equal,
    }
}

/// Sort direction of a [`SortField`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SortDirection {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// One entry of a query sort, serialized as `{"field": "asc"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortField {
    /// Dotted field path.
    pub field: String,
    /// Sort direction.
    pub direction: SortDirection,
}

impl SortField {
    /// Ascending sort on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    /// Descending sort on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

impl Serialize for SortField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.field, &self.direction.to_string())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for SortField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Field(String),
            Directed(Map<String, Value>),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Field(field) => Ok(Self::asc(field)),
            Raw::Directed(map) => {
                let (field, direction) = map
                    .into_iter()
                    .next()
                    .ok_or_else(|| serde::de::Error::custom("empty sort entry"))?;
                match direction.as_str() {
                    Some("asc") => Ok(Self::asc(field)),
                    Some("desc") => Ok(Self::desc(field)),
                    _ => Err(serde::de::Error::custom("sort direction must be asc or desc")),
                }
            }
        }
    }
}

/// A one-shot selector query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindQuery {
    /// Which documents to return.
    pub selector: Selector,
    /// Sort order, requires an index covering the sort fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortField>,
    /// Maximum number of documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Number of documents to skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
}

impl FindQuery {
    /// Creates a query with the given selector.
    pub fn new(selector: impl Into<Selector>) -> Self {
        Self {
            selector: selector.into(),
            ..Default::default()
        }
    }

    /// Adds a sort field.
    pub fn sort(mut self, field: SortField) -> Self {
        self.sort.push(field);
        self
    }

    /// Sets the limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the skip.
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Stable key identifying this query, used to share reactive queries.
    pub(crate) fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Orders documents according to the sort of this query, `_id` otherwise.
    pub(crate) fn sort_documents(&self, docs: &mut [Document]) {
        if self.sort.is_empty() {
            docs.sort_by(|a, b| a.id.cmp(&b.id));
            return;
        }
        docs.sort_by(|a, b| self.compare(a, b));
    }

    fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for SortField { field, direction } in &self.sort {
            let null: Cow<'_, Value> = Cow::Owned(Value::Null);
            let x = a.field(field).unwrap_or_else(|| null.clone());
            let y = b.field(field).unwrap_or(null);
            let ord = match direction {
                SortDirection::Asc => collate(&x, &y),
                SortDirection::Desc => collate(&y, &x),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Definition of a JSON index, e.g. `{"index": {"fields": ["type", "name"]}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// The indexed fields.
    pub index: IndexFields,
    /// Index name, derived by the store if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Design document holding the index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ddoc: Option<String>,
}

/// The `index` member of an [`IndexSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFields {
    /// Indexed field paths.
    pub fields: Vec<String>,
}

impl IndexSpec {
    /// Index on the given fields.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            index: IndexFields {
                fields: fields.into_iter().map(Into::into).collect(),
            },
            name: None,
            ddoc: None,
        }
    }

    /// Sets the index name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The fields of this index.
    pub fn fields(&self) -> &[String] {
        &self.index.fields
    }

    /// The name of this index, derived from the fields if not set.
    pub fn index_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("idx-{}", self.index.fields.join("-")))
    }

    /// Whether this index can answer the query.
    ///
    /// All indexed fields must be constrained by the selector, and all sort fields must be
    /// part of the index.
    pub(crate) fn covers(&self, query: &FindQuery) -> bool {
        let selected = query.selector.fields();
        let fields = self.fields();
        !fields.is_empty()
            && fields.iter().all(|f| selected.contains(f))
            && query.sort.iter().all(|s| fields.contains(&s.field))
    }
}

/// Outcome of [`IndexSpec`] creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOutcome {
    /// `created` or `exists`.
    pub result: String,
    /// Id of the design document holding the index.
    #[serde(default)]
    pub id: String,
    /// Name of the index.
    #[serde(default)]
    pub name: String,
}

/// Result of a one-shot query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindResponse {
    /// Matching documents.
    pub docs: Vec<Document>,
    /// Set when the query could not use an index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Pagination bookmark.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<String>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn member(id: &str, name: &str, age: u64) -> Document {
        Document::new(id)
            .with_type("member")
            .with("name", name)
            .with("age", age)
            .with("tags", json!(["veg", "fruit"]))
            .with("address", json!({"city": "Lyon"}))
    }

    #[test]
    fn equality_and_operators() {
        let doc = member("m1", "Ada", 36);
        let matches = |v: Value| Selector::new(v).matches(&doc);
        assert!(matches(json!({"type": "member"})));
        assert!(!matches(json!({"type": "contract"})));
        assert!(matches(json!({"age": {"$gt": 18, "$lte": 36}})));
        assert!(!matches(json!({"age": {"$lt": 36}})));
        assert!(matches(json!({"name": {"$in": ["Ada", "Bob"]}})));
        assert!(matches(json!({"name": {"$nin": ["Bob"]}})));
        assert!(matches(json!({"phone": {"$exists": false}})));
        assert!(!matches(json!({"phone": {"$ne": "1"}})));
        assert!(matches(json!({"tags": {"$size": 2, "$all": ["veg"]}})));
        assert!(matches(json!({"tags": {"$elemMatch": {"$eq": "fruit"}}})));
        assert!(matches(json!({"address": {"city": "Lyon"}})));
        assert!(matches(json!({"address.city": "Lyon"})));
        assert!(matches(json!({"_id": "m1"})));
    }

    #[test]
    fn combinations() {
        let doc = member("m1", "Ada", 36);
        let matches = |v: Value| Selector::new(v).matches(&doc);
        assert!(matches(json!({"$or": [{"name": "Bob"}, {"age": 36}]})));
        assert!(!matches(json!({"$and": [{"name": "Ada"}, {"age": 1}]})));
        assert!(matches(json!({"$nor": [{"name": "Bob"}]})));
        assert!(matches(json!({"$not": {"name": "Bob"}})));
        assert!(matches(json!({"age": {"$not": {"$lt": 10}}})));
    }

    #[test]
    fn type_filter_keeps_only_the_type() {
        let selector = Selector::new(json!({"type": "season", "current": true}));
        assert_eq!(selector.type_filter(), Some(Selector::of_type("season")));
        let selector = Selector::new(json!({"type": {"$eq": "member"}, "age": {"$gt": 1}}));
        assert_eq!(selector.type_filter(), Some(Selector::of_type("member")));
        assert_eq!(Selector::new(json!({"current": true})).type_filter(), None);
        let selector = Selector::new(json!({"type": {"$in": ["a", "b"]}}));
        assert_eq!(selector.type_filter(), None);

        // removals still pass the filter
        let doc = member("m1", "Ada", 36);
        let filter = Selector::new(json!({"type": "member", "age": 36}))
            .type_filter()
            .expect("type");
        assert!(filter.matches(&doc.tombstone()));
    }

    #[test]
    fn validation_rejects_unknown_operators() {
        assert!(Selector::new(json!({"a": {"$regex": "x"}})).validate().is_err());
        assert!(Selector::new(json!({"$xor": []})).validate().is_err());
        assert!(Selector::new(json!({"a": {"$in": 1}})).validate().is_err());
        assert!(Selector::new(json!([])).validate().is_err());
        assert!(
            Selector::new(json!({"type": "member", "$or": [{"a": {"$gt": 1}}]}))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn collation_order() {
        let values = [
            json!(null),
            json!(false),
            json!(true),
            json!(1),
            json!(2.5),
            json!("a"),
            json!("b"),
            json!(["a"]),
            json!({"a": 1}),
        ];
        for pair in values.windows(2) {
            assert_eq!(collate(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
    }

    #[test]
    fn sort_and_index_cover() {
        let query = FindQuery::new(json!({"type": "member", "name": {"$gt": null}}))
            .sort(SortField::desc("name"));
        let mut docs = vec![member("a", "Ada", 1), member("b", "Cyd", 2), member("c", "Bob", 3)];
        query.sort_documents(&mut docs);
        let names: Vec<_> = docs.iter().map(|d| d.body["name"].clone()).collect();
        assert_eq!(names, vec![json!("Cyd"), json!("Bob"), json!("Ada")]);

        assert!(IndexSpec::new(["type", "name"]).covers(&query));
        assert!(!IndexSpec::new(["type"]).covers(&query));
        assert!(!IndexSpec::new(["type", "age"]).covers(&query));
    }

    #[test]
    fn sort_field_serde() {
        let query = FindQuery::new(Selector::of_type("member"))
            .sort(SortField::asc("name"))
            .limit(5);
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(
            value,
            json!({"selector": {"type": "member"}, "sort": [{"name": "asc"}], "limit": 5})
        );
        let parsed: FindQuery =
            serde_json::from_value(json!({"selector": {}, "sort": ["a", {"b": "desc"}]}))
                .unwrap();
        assert_eq!(parsed.sort, vec![SortField::asc("a"), SortField::desc("b")]);
    }
}
