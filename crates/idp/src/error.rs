//! Error types for the IdP crate.

use axum::http::StatusCode;
use secmgr_core::session::SessionError;
use thiserror::Error;

/// Failures while turning an HTTP request into protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unsupported SOAP version: {0} is not a SOAP 1.1 Envelope")]
    VersionMismatch(String),

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("SOAP header {0} must be understood but is not")]
    HeaderNotUnderstood(String),

    #[error("envelope body contains no messages")]
    EmptyBody,

    #[error("unexpected body content: expected a SAML message but received {0}")]
    UnexpectedContent(String),

    #[error("unknown service provider: {0}")]
    UnknownServiceProvider(String),
}

/// Anything that ends an IdP request in failure.
#[derive(Debug, Error)]
pub enum IdpError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("credential pipeline error: {0}")]
    Pipeline(String),
}

impl IdpError {
    /// Status of the failure page sent to the user agent.
    pub fn status(&self) -> StatusCode {
        match self {
            IdpError::Decode(DecodeError::UnsupportedTransport(_)) => {
                StatusCode::METHOD_NOT_ALLOWED
            }
            IdpError::Decode(_) => StatusCode::BAD_REQUEST,
            IdpError::Session(_) => StatusCode::CONFLICT,
            IdpError::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// State-machine violations are invariant breaches, not bad input.
    pub fn is_state_violation(&self) -> bool {
        matches!(self, IdpError::Session(_))
    }
}
