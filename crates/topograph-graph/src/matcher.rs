//! Typed attribute matcher for subgraph queries.
//!
//! A query is a map from attribute key to a matcher: either an exact value
//! or a set of accepted values. A vertex matches when every key matches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use topograph_core::Vertex;

use crate::error::Result;

/// Matcher for a single attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Matcher {
    /// Attribute must equal one of the listed values.
    OneOf(Vec<Value>),
    /// Attribute must equal this value.
    Exact(Value),
}

impl Matcher {
    pub fn matches(&self, actual: &Value) -> bool {
        match self {
            Matcher::Exact(expected) => expected == actual,
            Matcher::OneOf(accepted) => accepted.contains(actual),
        }
    }
}

/// Conjunction of per-attribute matchers. Empty matches every vertex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryMatcher {
    clauses: BTreeMap<String, Matcher>,
}

impl QueryMatcher {
    /// The match-everything query.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build from a JSON object: array values become `OneOf`, anything else `Exact`.
    pub fn from_json(query: Value) -> Result<Self> {
        Ok(serde_json::from_value(query)?)
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.insert(key.into(), Matcher::Exact(value.into()));
        self
    }

    pub fn one_of<I, V>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.clauses.insert(key.into(), Matcher::OneOf(values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, vertex: &Vertex) -> bool {
        self.clauses.iter().all(|(key, matcher)| {
            vertex
                .attribute(key)
                .is_some_and(|actual| matcher.matches(&actual))
        })
    }
}
