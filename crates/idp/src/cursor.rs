//! Per-request iteration over the protocol messages an HTTP request carries.

use crate::error::DecodeError;
use crate::request::InboundRequest;
use crate::saml::SamlMessage;
use crate::soap::{Envelope, EnvelopeDecoder};

/// Outcome of asking a source for its next message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Message(SamlMessage),
    /// No more messages in this request. Not an error.
    Exhausted,
}

/// Something that yields the protocol messages of one request, in order.
pub trait MessageSource {
    fn next_message(&mut self) -> Result<Next, DecodeError>;
}

#[derive(Debug)]
struct OpenEnvelope {
    envelope: Envelope,
    position: usize,
}

/// Cursor over the body children of one SOAP envelope.
///
/// The envelope is decoded on the first call. A decode failure, including an
/// empty body, is returned again on every later call; once the children run
/// out every later call returns [`Next::Exhausted`]. The cursor borrows the
/// request it reads, so it cannot outlive or be moved to another request.
#[derive(Debug)]
pub struct MessageCursor<'r> {
    decoder: &'r EnvelopeDecoder,
    request: &'r InboundRequest,
    opened: Option<Result<OpenEnvelope, DecodeError>>,
}

impl<'r> MessageCursor<'r> {
    pub fn new(decoder: &'r EnvelopeDecoder, request: &'r InboundRequest) -> Self {
        Self {
            decoder,
            request,
            opened: None,
        }
    }

    /// Number of children consumed so far.
    pub fn position(&self) -> usize {
        match &self.opened {
            Some(Ok(open)) => open.position,
            _ => 0,
        }
    }
}

fn open(decoder: &EnvelopeDecoder, request: &InboundRequest) -> Result<OpenEnvelope, DecodeError> {
    let envelope = decoder.decode(&request.method, &request.body)?;
    if envelope.body.is_empty() {
        return Err(DecodeError::EmptyBody);
    }
    Ok(OpenEnvelope {
        envelope,
        position: 0,
    })
}

impl MessageSource for MessageCursor<'_> {
    fn next_message(&mut self) -> Result<Next, DecodeError> {
        let (decoder, request) = (self.decoder, self.request);
        let current = match self.opened.get_or_insert_with(|| open(decoder, request)) {
            Ok(current) => current,
            Err(e) => return Err(e.clone()),
        };

        let Some(child) = current.envelope.body.get(current.position) else {
            return Ok(Next::Exhausted);
        };
        current.position += 1;
        SamlMessage::from_child(child).map(Next::Message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::MessageKind;
    use axum::http::Method;

    fn soap_request(body: &str) -> InboundRequest {
        let xml = format!(
            r#"<soap11:Envelope xmlns:soap11="http://schemas.xmlsoap.org/soap/envelope/" xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"><soap11:Body>{body}</soap11:Body></soap11:Envelope>"#
        );
        InboundRequest::new(Method::POST, "/saml/soap").with_body(xml)
    }

    fn query(id: &str) -> String {
        format!(r#"<samlp:AuthzDecisionQuery ID="{id}" Version="2.0"/>"#)
    }

    fn expect_message(cursor: &mut MessageCursor<'_>) -> SamlMessage {
        match cursor.next_message().unwrap() {
            Next::Message(m) => m,
            Next::Exhausted => panic!("cursor exhausted early"),
        }
    }

    #[test]
    fn yields_each_child_in_order_then_exhausted() {
        for n in 1..=4 {
            let body: String = (0..n).map(|i| query(&format!("_q{i}"))).collect();
            let request = soap_request(&body);
            let decoder = EnvelopeDecoder::default();
            let mut cursor = MessageCursor::new(&decoder, &request);

            for i in 0..n {
                let msg = expect_message(&mut cursor);
                assert_eq!(msg.kind, MessageKind::AuthzDecisionQuery);
                assert_eq!(msg.header().unwrap().id, Some(format!("_q{i}")));
                assert_eq!(cursor.position(), i + 1);
            }
            assert_eq!(cursor.next_message().unwrap(), Next::Exhausted);
        }
    }

    #[test]
    fn exhausted_is_idempotent() {
        let request = soap_request(&query("_q"));
        let decoder = EnvelopeDecoder::default();
        let mut cursor = MessageCursor::new(&decoder, &request);
        expect_message(&mut cursor);
        for _ in 0..5 {
            assert_eq!(cursor.next_message().unwrap(), Next::Exhausted);
        }
        assert_eq!(cursor.position(), 1);
    }

    #[test]
    fn empty_body_fails_and_never_exhausts() {
        let request = soap_request("");
        let decoder = EnvelopeDecoder::default();
        let mut cursor = MessageCursor::new(&decoder, &request);
        for _ in 0..3 {
            assert_eq!(cursor.next_message().unwrap_err(), DecodeError::EmptyBody);
        }
    }

    #[test]
    fn header_not_understood_yields_nothing() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"><s:Header><h:T xmlns:h="urn:h" s:mustUnderstand="1"/></s:Header><s:Body><samlp:AuthnRequest ID="_a"/></s:Body></s:Envelope>"#;
        let request = InboundRequest::new(Method::POST, "/saml/soap").with_body(xml);
        let decoder = EnvelopeDecoder::default();
        let mut cursor = MessageCursor::new(&decoder, &request);
        for _ in 0..2 {
            assert_eq!(
                cursor.next_message().unwrap_err(),
                DecodeError::HeaderNotUnderstood("{urn:h}T".into())
            );
        }
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn unrecognized_child_fails_without_skipping() {
        let body = format!(
            r#"{}<x:Thing xmlns:x="urn:other"/>{}"#,
            query("_q1"),
            query("_q3")
        );
        let request = soap_request(&body);
        let decoder = EnvelopeDecoder::default();
        let mut cursor = MessageCursor::new(&decoder, &request);

        assert_eq!(expect_message(&mut cursor).header().unwrap().id.as_deref(), Some("_q1"));
        assert_eq!(
            cursor.next_message().unwrap_err(),
            DecodeError::UnexpectedContent("{urn:other}Thing".into())
        );
        assert_eq!(cursor.position(), 2);
        assert_eq!(expect_message(&mut cursor).header().unwrap().id.as_deref(), Some("_q3"));
        assert_eq!(cursor.next_message().unwrap(), Next::Exhausted);
    }

    #[test]
    fn non_post_request_is_unsupported() {
        let mut request = soap_request(&query("_q"));
        request.method = Method::GET;
        let decoder = EnvelopeDecoder::default();
        let mut cursor = MessageCursor::new(&decoder, &request);
        assert!(matches!(
            cursor.next_message(),
            Err(DecodeError::UnsupportedTransport(_))
        ));
    }

    #[test]
    fn optional_header_does_not_block_messages() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"><s:Header><h:T xmlns:h="urn:h"/></s:Header><s:Body><samlp:AuthnRequest ID="_a"/></s:Body></s:Envelope>"#;
        let request = InboundRequest::new(Method::POST, "/saml/soap").with_body(xml);
        let decoder = EnvelopeDecoder::default();
        let mut cursor = MessageCursor::new(&decoder, &request);
        assert_eq!(expect_message(&mut cursor).kind, MessageKind::AuthnRequest);
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.next_message().unwrap(), Next::Exhausted);
    }
}
