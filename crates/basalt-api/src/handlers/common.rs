//! Common API handler utilities.

use axum::response::Json;

use crate::models::{common::ApiResponse, error::ErrorResponse};

/// Unified Result type for all API handlers.
///
/// The success value is wrapped in ApiResponse.
pub type HandlerResult<T> = Result<Json<ApiResponse<T>>, ErrorResponse>;

/// Wrap `data` in a success response.
pub fn ok<T>(data: T) -> HandlerResult<T> {
    Ok(Json(ApiResponse::success(data)))
}
