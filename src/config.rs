/// Records per batch before mapping and bulk submission
pub const FLUSH_THRESHOLD: usize = 500;

/// Partial updates buffered by the linker before they are sent
pub const LINK_BATCH_SIZE: usize = 500;

/// Rows requested per page in cursor-paginated queries
pub const QUERY_PAGE_SIZE: usize = 1000;

/// Parents whose children are fetched with one query in the last link phase
pub const PARENT_LOOKUP_CHUNK: usize = 100;

/// Progress update interval (tick every N records)
pub const PROGRESS_INTERVAL: u64 = 1000;

/// HTTP request timeout for the index service
pub const HTTP_TIMEOUT_SECS: u64 = 60;

/// Default index service endpoint (a Solr core)
pub const DEFAULT_INDEX_URL: &str = "http://localhost:8983/solr/biblio";

/// Default authority index endpoint
pub const DEFAULT_AUTHORITY_URL: &str = "http://localhost:8983/solr/authority";

/// Unique key of every indexed document
pub const ID_FIELD: &str = "id";

/// Field stamped with the load timestamp of the run that last wrote the document
pub const TIMESTAMP_FIELD: &str = "indexTimestamp_str";

/// Control field tags tried, in order, for a record's fallback id
pub const RECORD_ID_TAGS: &[&str] = &["001", "SYS"];

/// Pseudo control tag under which the leader is addressable
pub const LEADER_TAG: &str = "LDR";

/// Replacement for blank or absent indicators
pub const INDICATOR_SENTINEL: char = '-';

/// Joins the matched value with its connected subfield values
pub const CONNECTED_SEPARATOR: &str = ", ";
