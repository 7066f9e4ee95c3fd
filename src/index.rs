use crate::config::ID_FIELD;
use crate::error::IndexError;
use crate::models::{Document, LinkDocument};
use tracing::trace;

/// A remote (or in-memory) document index.
///
/// Writes are only visible to `query` after `commit`.
pub trait IndexService {
    fn add(&self, docs: &[Document]) -> Result<(), IndexError>;

    /// Partial field updates; a missing document is created.
    fn update(&self, docs: &[LinkDocument]) -> Result<(), IndexError>;

    fn commit(&self) -> Result<(), IndexError>;

    fn optimize(&self) -> Result<(), IndexError>;

    /// Documents matching every filter, sorted by id ascending.
    fn query(&self, query: &Query) -> Result<Vec<Document>, IndexError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Equals { field: String, value: String },
    /// `field:*`
    Present(String),
    Not(Box<Filter>),
    AnyOf(Vec<Filter>),
}

impl Filter {
    pub fn equals(field: &str, value: impl Into<String>) -> Self {
        Filter::Equals {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn present(field: &str) -> Self {
        Filter::Present(field.to_string())
    }

    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    pub fn any_of(filters: Vec<Filter>) -> Self {
        Filter::AnyOf(filters)
    }

    /// Evaluates the filter against a stored document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Equals { field, value } => doc.get(field).iter().any(|v| v == value),
            Filter::Present(field) => !doc.get(field).is_empty(),
            Filter::Not(inner) => !inner.matches(doc),
            Filter::AnyOf(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

/// A filtered, id-ordered page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub filters: Vec<Filter>,
    /// Fields to return; empty returns all stored fields.
    pub fields: Vec<String>,
    pub rows: usize,
    /// Exclusive lower bound on the id.
    pub after_id: Option<String>,
}

impl Query {
    pub fn new(rows: usize) -> Self {
        Self {
            filters: Vec::new(),
            fields: Vec::new(),
            rows,
            after_id: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Requested fields; the id is always included so pages can be chained.
    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        if !self.fields.iter().any(|f| f == ID_FIELD) {
            self.fields.insert(0, ID_FIELD.to_string());
        }
        self
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.after_id = Some(id.into());
        self
    }
}

/// Walks every page of `query` with `id > last-seen-id` cursors, handing each
/// page to `visit` together with its page number. Returns the number of
/// documents visited.
pub fn for_each_page<F>(service: &dyn IndexService, query: &Query, mut visit: F) -> Result<usize, IndexError>
where
    F: FnMut(usize, Vec<Document>) -> Result<(), IndexError>,
{
    let mut page_query = query.clone();
    let mut page_no = 0;
    let mut total = 0;

    loop {
        let page = service.query(&page_query)?;
        if page.is_empty() {
            break;
        }
        let full = page.len() >= page_query.rows;
        let last_id = page
            .last()
            .and_then(Document::id)
            .map(str::to_string)
            .ok_or_else(|| IndexError::Decode("query result without id".to_string()))?;

        trace!(page = page_no, docs = page.len(), last_id = %last_id, "Query page");
        total += page.len();
        visit(page_no, page)?;

        if !full {
            break;
        }
        page_no += 1;
        page_query.after_id = Some(last_id);
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryIndex;

    fn seeded(n: usize) -> MemoryIndex {
        let index = MemoryIndex::new();
        let docs: Vec<Document> = (0..n)
            .map(|i| {
                let id = format!("{i:03}");
                let kind = if i % 2 == 0 { "even" } else { "odd" };
                Document::new().with("id", &[&id]).with("kind", &[kind])
            })
            .collect();
        index.add(&docs).unwrap();
        index.commit().unwrap();
        index
    }

    #[test]
    fn pages_follow_id_cursor() {
        let index = seeded(7);
        let query = Query::new(3).fields(&["kind"]);
        let mut pages = Vec::new();
        let total = for_each_page(&index, &query, |n, docs| {
            pages.push((n, docs.iter().filter_map(|d| d.id().map(str::to_string)).collect::<Vec<_>>()));
            Ok(())
        })
        .unwrap();

        assert_eq!(total, 7);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0], (0, vec!["000".to_string(), "001".into(), "002".into()]));
        assert_eq!(pages[2], (2, vec!["006".to_string()]));
    }

    #[test]
    fn exact_multiple_of_page_size_ends_on_empty_page() {
        let index = seeded(6);
        let mut calls = 0;
        let total = for_each_page(&index, &Query::new(3), |_, _| {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(total, 6);
        assert_eq!(calls, 2);
    }

    #[test]
    fn filters_compose() {
        let doc = Document::new().with("id", &["1"]).with("a", &["x", "y"]);
        assert!(Filter::equals("a", "y").matches(&doc));
        assert!(Filter::present("a").matches(&doc));
        assert!(Filter::not(Filter::present("b")).matches(&doc));
        assert!(Filter::any_of(vec![Filter::equals("a", "z"), Filter::equals("a", "x")]).matches(&doc));
        assert!(!Filter::any_of(vec![]).matches(&doc));
    }

    #[test]
    fn visitor_error_stops_paging() {
        let index = seeded(5);
        let result = for_each_page(&index, &Query::new(2), |n, _| {
            if n == 1 {
                Err(IndexError::Rejected("stop".into()))
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(IndexError::Rejected(_))));
    }
}
