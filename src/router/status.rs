//! Instance status.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    name: String,
    version: String,
    url: String,
}

pub async fn status(State(state): State<AppState>) -> Json<Response> {
    Json(Response {
        name: state.config.name.clone(),
        version: state.config.version.clone(),
        url: state.config.url.clone(),
    })
}
