//! Error taxonomy shared by the agents, the store and the VCS client.

use std::fmt;

/// The external collaborator an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Reasoning,
    Vcs,
    Store,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Reasoning => write!(f, "reasoning"),
            Service::Vcs => write!(f, "vcs"),
            Service::Store => write!(f, "store"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Timeout, rate limit or 5xx-equivalent. The only retryable kind.
    #[error("{service} transient failure: {message}")]
    Transient { service: Service, message: String },

    /// Reasoning output did not match the expected schema.
    #[error("failed to parse {schema} from reasoning output: {message} (response: {excerpt:?})")]
    Parse {
        schema: &'static str,
        message: String,
        excerpt: String,
    },

    /// Permanent VCS failure (validation, auth, conflict).
    #[error("vcs {operation} failed (status {status:?}): {message}")]
    Vcs {
        operation: String,
        status: Option<u16>,
        message: String,
    },

    /// Permanent reasoning provider failure (bad request, auth).
    #[error("reasoning provider rejected request (status {status}): {message}")]
    Provider { status: u16, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),

    /// Another delivery holds the conversation lease.
    #[error("conversation {0} is busy")]
    ConversationBusy(String),

    /// The conversation was modified after it was read.
    #[error("conversation {id} changed underneath (expected version {expected})")]
    VersionConflict { id: String, expected: i64 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length of a raw response excerpt carried in a parse error.
pub const EXCERPT_LEN: usize = 500;

impl Error {
    /// Whether the retry executor may try the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    pub fn transient(service: Service, message: impl Into<String>) -> Self {
        Error::Transient {
            service,
            message: message.into(),
        }
    }

    pub fn parse(schema: &'static str, message: impl Into<String>, raw: &str) -> Self {
        Error::Parse {
            schema,
            message: message.into(),
            excerpt: excerpt(raw, EXCERPT_LEN),
        }
    }
}

/// Truncate `raw` to at most `max` characters, marking the cut.
pub fn excerpt(raw: &str, max: usize) -> String {
    match raw.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &raw[..idx]),
        None => raw.to_string(),
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if is_sqlite_busy(&err) {
            return Error::transient(Service::Store, err.to_string());
        }
        Error::Store(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Store(format!("json column: {err}"))
    }
}

fn is_sqlite_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}
