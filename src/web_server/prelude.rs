pub use std::sync::Arc;

pub(crate) use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

pub(crate) use serde::Deserialize;

pub(crate) use crate::frame::SourceId;
pub(crate) use crate::protocol::{ApiResponse, error_response};
pub(crate) use crate::service::ServiceState;
pub(crate) use crate::sources::SourceState;
pub(crate) use crate::web_server::AppState;
pub(crate) use tracing::{debug, error, instrument};
