use axum::extract::{FromRequest, Json, Request};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::server::error::Error;

/// json body that has been through `validator` before a handler sees it
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| Error::BadRequest(e.body_text()))?;

        value
            .validate()
            .map_err(|e| Error::BadRequest(e.to_string().replace('\n', ", ")))?;

        Ok(Self(value))
    }
}
