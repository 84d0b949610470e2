use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

/// Handler error: a caller mistake maps to 400, everything else is a 500
/// carrying the upstream message.
#[derive(Debug)]
pub struct Error(anyhow::Error);

#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("bad request")]
    BadRequest,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        let (status, message) = match self.0.downcast_ref() {
            Some(HttpError::BadRequest) => (StatusCode::BAD_REQUEST, "bad request".to_string()),
            None => {
                error!("request failed: {message}");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

impl<T> From<T> for Error
where
    T: Into<anyhow::Error>,
{
    fn from(t: T) -> Self {
        Error(t.into())
    }
}

pub type AppResult<T> = Result<T, Error>;
