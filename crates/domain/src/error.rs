/// Shared error type used across all SignalZero crates.
///
/// The variants mirror the HTTP/JSON-RPC mapping done at the gateway:
/// `Unauthorized` → 401, `Forbidden` → 403, `NotFound` → 404,
/// `Conflict`/`Busy` → 409, `InvalidRequest`/`InvalidSymbol`/
/// `ReadOnlyDomain` → 400, `Unavailable` → 500.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The context session already has an in-flight message.
    #[error("context {0} is busy")]
    Busy(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A symbol failed invariant validation. `field` is the dotted path of
    /// the offending field (e.g. `facets.substrate`).
    #[error("invalid symbol: {reason} (field: {field})")]
    InvalidSymbol { reason: String, field: String },

    /// A write was attempted against a read-only domain.
    #[error("domain {domain_id} is read-only")]
    ReadOnlyDomain {
        domain_id: String,
        symbol_id: Option<String>,
    },

    #[error("backend {backend}: {message}")]
    Backend { backend: String, message: String },

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when retrying the same call might succeed (transport-level
    /// failures, not validation or policy denials).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::Backend { .. } | Error::Unavailable(_) | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_symbol_display_includes_field() {
        let err = Error::InvalidSymbol {
            reason: "value not in substrate enum".into(),
            field: "facets.substrate".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("facets.substrate"));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Http("timeout".into()).is_transient());
        assert!(Error::Unavailable("store down".into()).is_transient());
        assert!(!Error::Unauthorized.is_transient());
        assert!(!Error::Busy("s1".into()).is_transient());
    }
}
