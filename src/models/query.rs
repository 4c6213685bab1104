//! Closed-field query model for the materialized store
//!
//! Callers can only name fields through [`FilterableField`] and
//! [`RequestableField`]; the mapping from these enumerations to storage
//! columns is fixed, so no caller-supplied text ever reaches a column name.

use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

use super::record::{Header, StoredItem};

/// Fields that may appear in a filter clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterableField {
    Key,
    Value,
    Headers,
}

impl FilterableField {
    /// SQL expression the field compares against
    pub fn column_expr(self) -> &'static str {
        match self {
            FilterableField::Key => "item_key",
            FilterableField::Value => "CAST(item_value AS TEXT)",
            FilterableField::Headers => "item_headers",
        }
    }

    /// Text form of the field used when filtering outside of SQL
    ///
    /// `None` plays the role of SQL NULL.
    pub fn text_of(self, item: &StoredItem) -> Option<String> {
        match self {
            FilterableField::Key => Some(item.key.clone()),
            FilterableField::Value => Some(String::from_utf8_lossy(&item.value).into_owned()),
            FilterableField::Headers => {
                if item.headers.is_empty() {
                    None
                } else {
                    serde_json::to_string(&item.headers).ok()
                }
            },
        }
    }
}

/// Fields that may be requested in a projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestableField {
    Key,
    Value,
    Headers,
}

impl RequestableField {
    pub fn column(self) -> &'static str {
        match self {
            RequestableField::Key => "item_key",
            RequestableField::Value => "item_value",
            RequestableField::Headers => "item_headers",
        }
    }
}

/// Comparison applied by a filter clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterCriteria {
    Equals,
    Contains,
    DoesntEqual,
    DoesntContain,
    IsNull,
    IsEmpty,
}

impl FilterCriteria {
    /// Whether the criteria compares against a caller value
    pub fn takes_value(self) -> bool {
        !matches!(self, FilterCriteria::IsNull | FilterCriteria::IsEmpty)
    }

    /// Evaluate the criteria against a field's text, with `None` as NULL
    ///
    /// Mirrors SQLite semantics: comparisons against NULL never match, and
    /// `Contains` is ASCII case-insensitive like `LIKE`.
    pub fn matches(self, field: Option<&str>, value: &str) -> bool {
        match (self, field) {
            (FilterCriteria::IsNull, f) => f.is_none(),
            (_, None) => false,
            (FilterCriteria::Equals, Some(f)) => f == value,
            (FilterCriteria::DoesntEqual, Some(f)) => f != value,
            (FilterCriteria::Contains, Some(f)) => contains_ignore_ascii_case(f, value),
            (FilterCriteria::DoesntContain, Some(f)) => !contains_ignore_ascii_case(f, value),
            (FilterCriteria::IsEmpty, Some(f)) => f.is_empty(),
        }
    }
}

fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

/// One predicate of a query; all clauses of a query are combined with AND
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: FilterableField,
    pub criteria: FilterCriteria,
    #[serde(default)]
    pub value: Option<String>,
}

impl FilterClause {
    pub fn new(field: FilterableField, criteria: FilterCriteria, value: impl Into<String>) -> Self {
        Self {
            field,
            criteria,
            value: Some(value.into()),
        }
    }

    pub fn matches(&self, item: &StoredItem) -> bool {
        let text = self.field.text_of(item);
        self.criteria
            .matches(text.as_deref(), self.value.as_deref().unwrap_or_default())
    }
}

/// A query over the materialized store
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default)]
    #[validate(length(min = 1))]
    pub requested_fields: Vec<RequestableField>,
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    /// Per-request cap; the configured cap applies when absent
    #[serde(default)]
    pub limit: Option<u32>,
}

impl Query {
    /// Requested fields with duplicates removed, in first-seen order
    pub fn projection(&self) -> Vec<RequestableField> {
        let mut fields = Vec::with_capacity(self.requested_fields.len());
        for field in &self.requested_fields {
            if !fields.contains(field) {
                fields.push(*field);
            }
        }
        fields
    }

    pub fn matches(&self, item: &StoredItem) -> bool {
        self.filters.iter().all(|clause| clause.matches(item))
    }

    /// Effective row cap given the configured limit, where 0 means unlimited
    pub fn effective_limit(&self, configured: u32) -> Option<usize> {
        let cap = match (self.limit, configured) {
            (Some(0), 0) | (None, 0) => return None,
            (Some(0), c) | (None, c) => c,
            (Some(l), 0) => l,
            (Some(l), c) => l.min(c),
        };
        Some(cap as usize)
    }
}

/// A projected row; fields that were not requested are omitted
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectedItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<Header>>,
}

impl ProjectedItem {
    pub fn project(item: &StoredItem, fields: &[RequestableField]) -> Self {
        let mut projected = ProjectedItem::default();
        for field in fields {
            match field {
                RequestableField::Key => projected.key = Some(item.key.clone()),
                RequestableField::Value => {
                    projected.value = Some(String::from_utf8_lossy(&item.value).into_owned())
                },
                RequestableField::Headers => {
                    if !item.headers.is_empty() {
                        projected.headers = Some(item.headers.clone())
                    }
                },
            }
        }
        projected
    }
}

/// Completion status of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatusKind {
    Success,
    Warning,
    Error,
}

impl fmt::Display for QueryStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryStatusKind::Success => "Success",
            QueryStatusKind::Warning => "Warning",
            QueryStatusKind::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Status attached to every query result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStatus {
    pub status: QueryStatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub result_count: usize,
}

/// Result rows collected so far and how the scan ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    pub items: Vec<ProjectedItem>,
    pub status: QueryStatus,
}

impl QueryOutcome {
    pub fn success(items: Vec<ProjectedItem>) -> Self {
        Self::with_status(items, QueryStatusKind::Success, None)
    }

    pub fn timed_out(items: Vec<ProjectedItem>) -> Self {
        Self::with_status(items, QueryStatusKind::Warning, Some("timeout"))
    }

    pub fn canceled(items: Vec<ProjectedItem>) -> Self {
        Self::with_status(items, QueryStatusKind::Error, Some("canceled"))
    }

    fn with_status(items: Vec<ProjectedItem>, status: QueryStatusKind, reason: Option<&str>) -> Self {
        let result_count = items.len();
        Self {
            items,
            status: QueryStatus {
                status,
                reason: reason.map(str::to_string),
                result_count,
            },
        }
    }
}
