//! HTTP API surface.

pub mod create;
pub mod login;
pub mod security;
pub mod sessions;
pub mod status;
pub mod two_factor;
pub mod users;

use axum::Json;
use axum::extract::{FromRequest, Request};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::ServerError;

/// JSON extractor that decodes the body once into a schema-validated type.
/// Handlers only ever see requests that already passed validation.
pub struct Valid<T>(pub T);

impl<S, T> FromRequest<S> for Valid<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
{
    type Rejection = ServerError;

    async fn from_request(
        req: Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;

        Ok(Valid(value))
    }
}

#[cfg(test)]
pub(crate) fn state() -> crate::AppState {
    use std::sync::Arc;

    let mut config = crate::config::Configuration::default();
    config.name = "Atelier".to_owned();
    config.url = "https://review.atelier.test/".to_owned();

    crate::AppState::assemble(
        Arc::new(config),
        crate::test_util::crypto(),
        crate::store::Stores::in_memory(),
    )
}
