use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Generic API response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: "Success".to_string(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message,
        }
    }
}

/// An error body with a status code other than 200.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ApiResponse::<()>::error(message.into()))).into_response()
}

#[test]
fn test_error_envelope() {
    let body = serde_json::to_value(ApiResponse::<()>::error("Unknown source usb".to_string()))
        .expect("Failed to serialize");
    assert_eq!(body["success"], false);
    assert!(body["data"].is_null());
    assert_eq!(body["message"], "Unknown source usb");
}
