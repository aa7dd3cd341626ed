use axum::{extract::FromRequestParts, http::request::Parts};
use vigil_model::OwnerId;

use crate::errors::AppError;

/// Header set by the upstream authentication layer.
pub const OWNER_HEADER: &str = "x-vigil-owner";

/// Owner identity of the caller. Authentication happens upstream; this only
/// reads the identity it forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner(pub OwnerId);

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(OWNER_HEADER)
            .ok_or_else(|| {
                AppError::unauthorized(format!("missing {OWNER_HEADER} header"))
            })?
            .to_str()
            .map_err(|_| {
                AppError::bad_request(format!("{OWNER_HEADER} is not valid text"))
            })?;
        raw.parse::<OwnerId>()
            .map(Owner)
            .map_err(|err| AppError::bad_request(err.to_string()))
    }
}
