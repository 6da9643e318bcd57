use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Errors surfaced at the client boundary.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("no credentials")]
    NoCredentials,
    #[error("model not found: {0}")]
    UnknownModel(String),
    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16, body: String },
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::UpstreamTransport(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            AppError::NoCredentials => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "no credentials".to_string(),
            ),
            AppError::UnknownModel(model) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                format!("model not found: {}", model),
            ),
            AppError::UpstreamStatus { status, body } => {
                // char-bounded: upstream error text is often multibyte
                let end = body
                    .char_indices()
                    .nth(200)
                    .map_or(body.len(), |(i, _)| i);
                (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    format!("upstream returned status {}: {}", status, &body[..end]),
                )
            }
            AppError::UpstreamTransport(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request_error", msg),
        };

        let body = Json(serde_json::json!({
            "error": {
                "type": error_type,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_body_excerpt_is_bounded() {
        let err = AppError::UpstreamStatus {
            status: 500,
            body: "x".repeat(5000),
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn multibyte_upstream_body_does_not_split_a_char() {
        // every char is 3 bytes, so byte offset 200 is mid-character
        let err = AppError::UpstreamStatus {
            status: 502,
            body: "错".repeat(500),
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn no_credentials_maps_to_503() {
        let resp = AppError::NoCredentials.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
