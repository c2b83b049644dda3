//! Axum routes for the IdP.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};

use crate::endpoint::IdpEndpoint;
use crate::request::InboundRequest;

pub const SSO_PATH: &str = "/saml/sso";
pub const SOAP_PATH: &str = "/saml/soap";
pub const METADATA_PATH: &str = "/saml/metadata";

/// Shared state for IdP routes.
pub struct IdpState {
    pub endpoint: IdpEndpoint,
}

/// Build the IdP Axum router.
pub fn router(state: Arc<IdpState>) -> Router {
    Router::new()
        .route(METADATA_PATH, get(saml_metadata))
        .route(SSO_PATH, get(sso_initial_contact).post(sso_credential_postback))
        .route(SOAP_PATH, any(soap_envelope))
        .with_state(state)
}

// -- Handlers --

async fn saml_metadata(State(state): State<Arc<IdpState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/samlmetadata+xml")],
        state.endpoint.metadata(),
    )
        .into_response()
}

async fn sso_initial_contact(
    State(state): State<Arc<IdpState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let request = InboundRequest::from_parts(Method::GET, &uri, headers, Bytes::new());
    state.endpoint.initial_contact(&request).await
}

async fn sso_credential_postback(
    State(state): State<Arc<IdpState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = InboundRequest::from_parts(Method::POST, &uri, headers, body);
    state.endpoint.credential_postback(&request).await
}

/// Every method is routed here so the envelope decoder, not the router,
/// rejects non-POST requests with a SOAP fault.
async fn soap_envelope(
    State(state): State<Arc<IdpState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = InboundRequest::from_parts(method, &uri, headers, body);
    state.endpoint.soap_batch(&request)
}
