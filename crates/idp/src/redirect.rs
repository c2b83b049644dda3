//! SAML 2.0 HTTP-Redirect binding: one message in the `SAMLRequest` query
//! parameter, DEFLATE-compressed and base64-encoded.

use std::io::Read;

use axum::http::Method;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::DeflateDecoder;
use tracing::debug;

use crate::cursor::{MessageSource, Next};
use crate::error::DecodeError;
use crate::request::InboundRequest;
use crate::saml::SamlMessage;

pub const SAML_REQUEST_PARAM: &str = "SAMLRequest";
pub const RELAY_STATE_PARAM: &str = "RelayState";

/// Upper bound on the inflated size of a redirect-bound message.
const MAX_INFLATED_LEN: usize = 64 * 1024;

enum SourceState {
    Pending,
    Yielded,
    Failed(DecodeError),
}

/// Message source for a single HTTP-Redirect request.
///
/// Yields the carried message once, then [`Next::Exhausted`] forever.
pub struct RedirectSource<'r> {
    request: &'r InboundRequest,
    state: SourceState,
}

impl<'r> RedirectSource<'r> {
    pub fn new(request: &'r InboundRequest) -> Self {
        Self {
            request,
            state: SourceState::Pending,
        }
    }

    pub fn relay_state(&self) -> Option<String> {
        self.request
            .query_param(RELAY_STATE_PARAM)
            .filter(|s| !s.is_empty())
    }

    fn decode(&self) -> Result<SamlMessage, DecodeError> {
        if self.request.method != Method::GET {
            return Err(DecodeError::UnsupportedTransport(format!(
                "the redirect binding only supports HTTP GET, got {}",
                self.request.method
            )));
        }
        let encoded = self
            .request
            .query_param(SAML_REQUEST_PARAM)
            .ok_or_else(|| {
                DecodeError::MalformedEnvelope(format!("missing {SAML_REQUEST_PARAM} parameter"))
            })?;
        let xml = decode_redirect_payload(&encoded)?;
        debug!(bytes = xml.len(), "decoded redirect-bound message");
        SamlMessage::parse(xml)
    }
}

impl MessageSource for RedirectSource<'_> {
    fn next_message(&mut self) -> Result<Next, DecodeError> {
        match &self.state {
            SourceState::Yielded => return Ok(Next::Exhausted),
            SourceState::Failed(e) => return Err(e.clone()),
            SourceState::Pending => {}
        }
        match self.decode() {
            Ok(message) => {
                self.state = SourceState::Yielded;
                Ok(Next::Message(message))
            }
            Err(e) => {
                self.state = SourceState::Failed(e.clone());
                Err(e)
            }
        }
    }
}

/// Base64-decode and inflate a `SAMLRequest` value.
///
/// Some senders skip compression; a payload that does not inflate but is
/// already XML is accepted as is.
pub fn decode_redirect_payload(encoded: &str) -> Result<String, DecodeError> {
    // An unescaped '+' in the query string arrives as a space.
    let cleaned: String = encoded
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .map(|c| if c == ' ' { '+' } else { c })
        .collect();
    let raw = BASE64
        .decode(cleaned.as_bytes())
        .map_err(|e| DecodeError::MalformedEnvelope(format!("invalid base64: {e}")))?;

    match inflate(&raw)? {
        Some(xml) => Ok(xml),
        None => match String::from_utf8(raw) {
            Ok(xml) if xml.trim_start().starts_with('<') => Ok(xml),
            _ => Err(DecodeError::MalformedEnvelope(
                "payload is neither DEFLATE-compressed nor plain XML".into(),
            )),
        },
    }
}

fn inflate(raw: &[u8]) -> Result<Option<String>, DecodeError> {
    let mut out = Vec::new();
    let limit = (MAX_INFLATED_LEN + 1) as u64;
    if DeflateDecoder::new(raw)
        .take(limit)
        .read_to_end(&mut out)
        .is_err()
    {
        return Ok(None);
    }
    if out.len() > MAX_INFLATED_LEN {
        return Err(DecodeError::MalformedEnvelope(format!(
            "inflated message exceeds {MAX_INFLATED_LEN} bytes"
        )));
    }
    match String::from_utf8(out) {
        Ok(xml) if xml.trim_start().starts_with('<') => Ok(Some(xml)),
        _ => Ok(None),
    }
}
