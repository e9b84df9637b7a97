use http::StatusCode;

/// Shared error type used across all daemon crates.
///
/// Every variant carries enough information to answer both questions a
/// caller at the HTTP boundary needs: which status code, and (for variants
/// that also surface as a `turn.error` event) which stable `code` string.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("storage full: {0}")]
    StorageFull(String),

    #[error("permission request already resolved")]
    PermissionConflict,

    #[error("permission request unknown")]
    PermissionUnknown,

    #[error("turn cancelled")]
    Cancelled,

    #[error("model preflight: no loaded models")]
    NoModelLoaded,

    #[error("model preflight: connection refused")]
    LmxConnectionRefused,

    #[error("model preflight: transport closed mid-stream")]
    LmxWsClosed,

    #[error("model preflight: timeout")]
    LmxTimeout,

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status this error maps to, per the error taxonomy.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) | Error::PermissionUnknown => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::StateConflict(_) | Error::PermissionConflict => StatusCode::CONFLICT,
            Error::StorageFull(_) => StatusCode::INSUFFICIENT_STORAGE,
            Error::Io(_) | Error::Json(_) | Error::Config(_) | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::Cancelled
            | Error::NoModelLoaded
            | Error::LmxConnectionRefused
            | Error::LmxWsClosed
            | Error::LmxTimeout => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The `turn.error.payload.code` string for errors that can terminate a
    /// turn, or `None` for errors with no stable code (e.g. cancellation,
    /// which carries a fixed message but no `code`).
    pub fn turn_error_code(&self) -> Option<&'static str> {
        match self {
            Error::NoModelLoaded => Some("no-model-loaded"),
            Error::LmxWsClosed => Some("lmx-ws-closed"),
            Error::LmxTimeout => Some("lmx-timeout"),
            Error::LmxConnectionRefused => Some("lmx-connection-refused"),
            Error::StorageFull(_) => Some("storage-full"),
            Error::StateConflict(_) => Some("state-conflict"),
            _ => None,
        }
    }

    /// The message placed in `turn.error.payload.message` for this error.
    pub fn turn_error_message(&self) -> String {
        match self {
            Error::Cancelled => "Turn cancelled".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_has_no_code_but_fixed_message() {
        let e = Error::Cancelled;
        assert_eq!(e.turn_error_code(), None);
        assert_eq!(e.turn_error_message(), "Turn cancelled");
    }

    #[test]
    fn storage_full_maps_to_507_and_code() {
        let e = Error::StorageFull("disk".into());
        assert_eq!(e.status_code(), StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(e.turn_error_code(), Some("storage-full"));
    }

    #[test]
    fn permission_conflict_maps_to_409() {
        assert_eq!(Error::PermissionConflict.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn permission_unknown_maps_to_404() {
        assert_eq!(Error::PermissionUnknown.status_code(), StatusCode::NOT_FOUND);
    }
}
