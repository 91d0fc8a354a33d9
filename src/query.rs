//! The closed query shape for reading documents from a replica.

use serde::{Deserialize, Serialize};

use crate::doc::Document;
use crate::keys::AuthorId;

/// Which document versions a query sees.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HistoryMode {
    /// Only the latest document per path.
    #[default]
    Latest,
    /// Every retained document, including older versions by other authors.
    All,
}

/// Sort order for query results.
///
/// The path orderings use the natural path order: `path` ascending with
/// newest-first tie-break inside a path (descending for [`OrderBy::PathDesc`]).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderBy {
    /// Path ascending.
    #[default]
    PathAsc,
    /// Path descending.
    PathDesc,
    /// Local index ascending.
    LocalIndexAsc,
    /// Local index descending.
    LocalIndexDesc,
}

impl OrderBy {
    /// Whether this ordering walks the path axis.
    pub fn is_path_axis(&self) -> bool {
        matches!(self, OrderBy::PathAsc | OrderBy::PathDesc)
    }

    /// Whether this ordering is descending.
    pub fn is_descending(&self) -> bool {
        matches!(self, OrderBy::PathDesc | OrderBy::LocalIndexDesc)
    }
}

/// Inclusive starting bound for a query.
///
/// Ignored when its axis does not match the query's [`OrderBy`]. For
/// ascending orders it is an inclusive lower bound, for descending orders an
/// inclusive upper bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartAt {
    /// Start at this path.
    Path(String),
    /// Start at this local index.
    LocalIndex(u64),
}

/// Field filters; all present filters must hold.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    /// Exact path.
    pub path: Option<String>,
    /// Path prefix.
    pub path_starts_with: Option<String>,
    /// Path suffix.
    pub path_ends_with: Option<String>,
    /// Exact author.
    pub author: Option<AuthorId>,
    /// Exact timestamp.
    pub timestamp: Option<u64>,
    /// Timestamp strictly greater than.
    pub timestamp_gt: Option<u64>,
    /// Timestamp strictly less than.
    pub timestamp_lt: Option<u64>,
    /// Exact content length.
    pub content_length: Option<u64>,
    /// Content length strictly greater than.
    pub content_length_gt: Option<u64>,
    /// Content length strictly less than.
    pub content_length_lt: Option<u64>,
}

impl Filter {
    /// Whether the document satisfies every present relation.
    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(path) = &self.path {
            if doc.path() != path {
                return false;
            }
        }
        if let Some(prefix) = &self.path_starts_with {
            if !doc.path().starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(suffix) = &self.path_ends_with {
            if !doc.path().ends_with(suffix.as_str()) {
                return false;
            }
        }
        if let Some(author) = &self.author {
            if doc.author() != author {
                return false;
            }
        }
        if let Some(t) = self.timestamp {
            if doc.timestamp() != t {
                return false;
            }
        }
        if let Some(t) = self.timestamp_gt {
            if doc.timestamp() <= t {
                return false;
            }
        }
        if let Some(t) = self.timestamp_lt {
            if doc.timestamp() >= t {
                return false;
            }
        }
        if let Some(len) = self.content_length {
            if doc.content_length() != len {
                return false;
            }
        }
        if let Some(len) = self.content_length_gt {
            if doc.content_length() <= len {
                return false;
            }
        }
        if let Some(len) = self.content_length_lt {
            if doc.content_length() >= len {
                return false;
            }
        }
        true
    }
}

/// A query over a replica's documents.
///
/// Evaluation order: select the base set per `history`, sort by `order_by`,
/// skip until `start_at`, apply `filter`, accumulate until `limit`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    /// Which versions to consider.
    pub history: HistoryMode,
    /// Result ordering.
    pub order_by: OrderBy,
    /// Inclusive starting bound on the ordering axis.
    pub start_at: Option<StartAt>,
    /// Field filters.
    pub filter: Filter,
    /// Maximum number of documents returned.
    pub limit: Option<usize>,
}

impl Query {
    /// Query over the latest document per path.
    pub fn latest() -> Self {
        Query::default()
    }

    /// Query over all retained documents.
    pub fn all() -> Self {
        Query {
            history: HistoryMode::All,
            ..Default::default()
        }
    }

    /// Set the result ordering.
    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    /// Set the inclusive starting bound.
    pub fn start_at(mut self, start_at: StartAt) -> Self {
        self.start_at = Some(start_at);
        self
    }

    /// Set the field filters.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Limit the number of returned documents.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document is past the inclusive starting bound.
    pub(crate) fn past_start(&self, doc: &Document) -> bool {
        match (&self.start_at, self.order_by) {
            (Some(StartAt::Path(p)), OrderBy::PathAsc) => doc.path() >= p.as_str(),
            (Some(StartAt::Path(p)), OrderBy::PathDesc) => doc.path() <= p.as_str(),
            (Some(StartAt::LocalIndex(i)), OrderBy::LocalIndexAsc) => doc.local_index() >= *i,
            (Some(StartAt::LocalIndex(i)), OrderBy::LocalIndexDesc) => doc.local_index() <= *i,
            // Bound axis does not match the ordering: ignored.
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::DocRecord;
    use crate::keys::Author;

    #[test]
    fn test_filter_conjunction() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let doc = DocRecord::new("/wiki/salads", author.id(), 500, "tomato").sign(&author);

        let mut filter = Filter {
            path_starts_with: Some("/wiki/".into()),
            path_ends_with: Some("salads".into()),
            timestamp_gt: Some(400),
            content_length: Some(6),
            ..Default::default()
        };
        assert!(filter.matches(&doc));

        filter.timestamp_lt = Some(500);
        assert!(!filter.matches(&doc));
    }

    #[test]
    fn test_start_at_ignores_mismatched_axis() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let doc = DocRecord::new("/b", author.id(), 500, "x").sign(&author);

        let q = Query::all()
            .order_by(OrderBy::LocalIndexAsc)
            .start_at(StartAt::Path("/z".into()));
        assert!(q.past_start(&doc));

        let q = Query::all().start_at(StartAt::Path("/c".into()));
        assert!(!q.past_start(&doc));
    }
}
