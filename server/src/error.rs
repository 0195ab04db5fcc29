use hyper::{header, Body, Response, StatusCode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid auth scheme")]
    Unauthorized,

    #[error("invalid token")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("No available IPs in subnet")]
    AddressPoolExhausted,

    #[error("internal database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("WireGuard update failed: {0}")]
    WireGuard(String),

    #[error("filter update failed: {0}")]
    Filter(String),

    #[error("internal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing/serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("generic HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("generic hyper error: {0}")]
    Hyper(#[from] hyper::Error),
}

impl<'a> From<&'a ServerError> for StatusCode {
    fn from(error: &ServerError) -> StatusCode {
        use ServerError::*;
        match error {
            Unauthorized => StatusCode::UNAUTHORIZED,
            Forbidden => StatusCode::FORBIDDEN,
            NotFound(_) => StatusCode::NOT_FOUND,
            BadRequest(_) | Json(_) => StatusCode::BAD_REQUEST,
            // clients expect 401 for pool exhaustion
            AddressPoolExhausted => StatusCode::UNAUTHORIZED,
            // Special-case the constraint violation situation.
            Database(rusqlite::Error::SqliteFailure(libsqlite3_sys::Error { code, .. }, ..))
                if *code == libsqlite3_sys::ErrorCode::ConstraintViolation =>
            {
                StatusCode::BAD_REQUEST
            },
            Database(rusqlite::Error::QueryReturnedNoRows) => StatusCode::NOT_FOUND,
            WireGuard(_) | Filter(_) | Io(_) | Database(_) | Http(_) | Hyper(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }
}

impl TryFrom<ServerError> for Response<Body> {
    type Error = hyper::http::Error;

    fn try_from(e: ServerError) -> Result<Self, Self::Error> {
        let detail = serde_json::json!({ "detail": e.to_string() }).to_string();
        Response::builder()
            .status(StatusCode::from(&e))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(detail))
    }
}
