//! Predicate-list queries understood by every document store collaborator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// A fetched document. `id` is the document key; `fields` the stored body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Builds a document from a JSON object; non-object values yield an empty body.
    pub fn from_json(id: impl Into<String>, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(id, fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        let mut parts = field.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// The cached representation: the body with `id` merged in.
    pub fn to_entity(&self) -> Value {
        let mut body = self.fields.clone();
        body.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(body)
    }

    /// Inverse of [`Document::to_entity`].
    pub fn from_entity(value: Value) -> Option<Self> {
        let mut body = match value {
            Value::Object(map) => map,
            _ => return None,
        };
        let id = match body.remove("id") {
            Some(Value::String(id)) => id,
            _ => return None,
        };
        Some(Self::new(id, body))
    }
}

/// Top-level collection or a subcollection under one parent document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollectionPath {
    Root(String),
    Nested {
        parent: String,
        parent_id: String,
        name: String,
    },
}

impl CollectionPath {
    pub fn root(name: impl Into<String>) -> Self {
        Self::Root(name.into())
    }

    pub fn nested(
        parent: impl Into<String>,
        parent_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::Nested {
            parent: parent.into(),
            parent_id: parent_id.into(),
            name: name.into(),
        }
    }

    /// Last path segment (the collection id the backend queries).
    pub fn collection_id(&self) -> &str {
        match self {
            Self::Root(name) => name,
            Self::Nested { name, .. } => name,
        }
    }

    pub fn parse(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [name] => Some(Self::root(*name)),
            [parent, parent_id, name] => Some(Self::nested(*parent, *parent_id, *name)),
            _ => None,
        }
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root(name) => write!(f, "{}", name),
            Self::Nested {
                parent,
                parent_id,
                name,
            } => write!(f, "{}/{}/{}", parent, parent_id, name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Eq { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Gt { field: String, value: Value },
    OrderBy { field: String, direction: SortDirection },
    Limit { count: usize },
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn in_values<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn order_by(field: impl Into<String>, direction: SortDirection) -> Self {
        Self::OrderBy {
            field: field.into(),
            direction,
        }
    }

    pub fn limit(count: usize) -> Self {
        Self::Limit { count }
    }

    fn admits(&self, doc: &Document) -> bool {
        match self {
            Self::Eq { field, value } => doc.get(field) == Some(value),
            Self::In { field, values } => doc
                .get(field)
                .map(|actual| values.contains(actual))
                .unwrap_or(false),
            Self::Gt { field, value } => doc
                .get(field)
                .and_then(|actual| compare_values(actual, value))
                .map(|ord| ord == Ordering::Greater)
                .unwrap_or(false),
            Self::OrderBy { .. } | Self::Limit { .. } => true,
        }
    }
}

/// Orders numbers numerically and strings lexically (RFC 3339 timestamps sort
/// correctly as strings). Mixed kinds are incomparable.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: CollectionPath,
    pub predicates: Vec<Predicate>,
}

impl Query {
    pub fn new(collection: CollectionPath, predicates: Vec<Predicate>) -> Self {
        Self {
            collection,
            predicates,
        }
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn with_all(mut self, extra: impl IntoIterator<Item = Predicate>) -> Self {
        self.predicates.extend(extra);
        self
    }

    pub fn limit(&self) -> Option<usize> {
        self.predicates.iter().rev().find_map(|p| match p {
            Predicate::Limit { count } => Some(*count),
            _ => None,
        })
    }

    /// Largest inclusion set carried by this query.
    pub fn max_inclusion_len(&self) -> usize {
        self.predicates
            .iter()
            .filter_map(|p| match p {
                Predicate::In { values, .. } => Some(values.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.predicates.iter().all(|p| p.admits(doc))
    }

    /// Filters, orders and limits `docs` the way a backend would.
    pub fn apply<'a, I>(&self, docs: I) -> Vec<Document>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut matched: Vec<Document> = docs
            .into_iter()
            .filter(|doc| self.matches(doc))
            .cloned()
            .collect();

        let orderings: Vec<(&str, SortDirection)> = self
            .predicates
            .iter()
            .filter_map(|p| match p {
                Predicate::OrderBy { field, direction } => Some((field.as_str(), *direction)),
                _ => None,
            })
            .collect();
        if !orderings.is_empty() {
            matched.sort_by(|a, b| {
                for (field, direction) in &orderings {
                    let ord = match (a.get(field), b.get(field)) {
                        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                        (Some(_), None) => Ordering::Less,
                        (None, Some(_)) => Ordering::Greater,
                        (None, None) => Ordering::Equal,
                    };
                    let ord = match direction {
                        SortDirection::Ascending => ord,
                        SortDirection::Descending => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        if let Some(limit) = self.limit() {
            matched.truncate(limit);
        }
        matched
    }
}
