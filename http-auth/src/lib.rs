//! Worker authentication for the HTTP API.
//!
//! Workers authenticate with HTTP basic auth: the password is checked
//! against a single operator-rotated shared secret, and the username is
//! carried through as the worker's identity. There is no user database.

use std::sync::Arc;

use axum::{
    RequestPartsExt,
    extract::{FromRef, FromRequestParts},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::{TypedHeader, typed_header::TypedHeaderRejectionReason};
use headers::{Authorization, authorization::Basic};
use http_common::{BoxRequestError, RequestError};

/// The shared secret the worker API is gated on.
///
/// Never printed: the `Debug` impl is redacted.
#[derive(Clone)]
pub struct ApiSecret(Arc<str>);

impl ApiSecret {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self(secret.into())
    }

    fn matches(&self, candidate: &str) -> bool {
        *self.0 == *candidate
    }
}

impl std::fmt::Debug for ApiSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiSecret(..)")
    }
}

/// The authenticated identity of the worker making a request.
///
/// Extracting this from a request performs the auth check; handlers that
/// take a `WorkerIdentity` argument are gated on the shared secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity(pub String);

impl WorkerIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingAuthHeader,

    #[error("invalid authorization header")]
    InvalidAuthHeader,

    #[error("user {0} is unauthorized")]
    Unauthorized(String),
}

impl RequestError for AuthError {
    fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        BoxRequestError::from(self).into_response()
    }
}

impl<S> FromRequestParts<S> for WorkerIdentity
where
    S: Send + Sync,
    ApiSecret: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(basic)) = parts
            .extract::<TypedHeader<Authorization<Basic>>>()
            .await
            .map_err(|err| match err.reason() {
                TypedHeaderRejectionReason::Missing => AuthError::MissingAuthHeader,
                _ => AuthError::InvalidAuthHeader,
            })?;

        let secret = ApiSecret::from_ref(state);
        if !secret.matches(basic.password()) {
            return Err(AuthError::Unauthorized(basic.username().to_owned()));
        }

        Ok(WorkerIdentity(basic.username().to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_reveals_the_secret() {
        let secret = ApiSecret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "ApiSecret(..)");
    }

    #[test]
    fn secret_comparison_is_exact() {
        let secret = ApiSecret::new("hunter2");
        assert!(secret.matches("hunter2"));
        assert!(!secret.matches("hunter"));
        assert!(!secret.matches("hunter22"));
        assert!(!secret.matches(""));
    }
}
