use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while compiling a rule set. All of them abort the run.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Rule syntax error on line {line} ('{target}'): {message}")]
    Syntax {
        line: usize,
        target: String,
        message: String,
    },

    #[error("Cannot read rule file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that end reading of the current input document.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("XML error at byte {position}: {source}")]
    Xml {
        position: usize,
        #[source]
        source: quick_xml::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the index service.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Connection refused, timeout, broken body.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success status from the service.
    #[error("Index service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body could not be understood.
    #[error("Cannot decode index response: {0}")]
    Decode(String),

    /// The service accepted the request but refused the operation.
    #[error("Index service rejected request: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for IndexError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            IndexError::Decode(e.to_string())
        } else {
            IndexError::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::Decode(e.to_string())
    }
}
