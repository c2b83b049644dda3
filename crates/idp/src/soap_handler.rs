//! Answers to individual protocol messages delivered over SOAP.

use tracing::debug;

use crate::saml::{
    build_status_response, SamlMessage, STATUS_REQUESTER, STATUS_REQUEST_UNSUPPORTED,
};

/// Produces the serialized response element for one SOAP-delivered message.
pub trait SoapMessageHandler: Send + Sync {
    fn respond(&self, message: &SamlMessage) -> String;
}

/// Answers every message with a `RequestUnsupported` status.
///
/// This IdP authenticates over the browser bindings only; the SOAP endpoint
/// exists so relying parties batching queries get a well-formed answer per
/// message instead of a transport fault.
#[derive(Debug, Clone)]
pub struct UnsupportedRequestResponder {
    entity_id: String,
}

impl UnsupportedRequestResponder {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
        }
    }
}

impl SoapMessageHandler for UnsupportedRequestResponder {
    fn respond(&self, message: &SamlMessage) -> String {
        let request_id = message.header().ok().and_then(|h| h.id);
        debug!(kind = %message.kind, request_id = ?request_id, "answering SOAP message");
        build_status_response(
            &self.entity_id,
            None,
            request_id.as_deref(),
            STATUS_REQUESTER,
            Some(STATUS_REQUEST_UNSUPPORTED),
            &format!("{} is not supported at this endpoint", message.kind),
        )
    }
}
