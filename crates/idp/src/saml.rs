//! SAML 2.0 protocol messages: recognition, header parsing, response and
//! metadata XML generation.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::{NsReader, Reader};
use secmgr_core::session::Principal;
use uuid::Uuid;

use crate::error::DecodeError;
use crate::soap::{BodyChild, ExpandedName};

pub const SAML2_PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const SAML2_ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";

pub const BINDING_HTTP_REDIRECT: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";
pub const BINDING_SOAP: &str = "urn:oasis:names:tc:SAML:2.0:bindings:SOAP";

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const STATUS_REQUESTER: &str = "urn:oasis:names:tc:SAML:2.0:status:Requester";
pub const STATUS_RESPONDER: &str = "urn:oasis:names:tc:SAML:2.0:status:Responder";
pub const STATUS_AUTHN_FAILED: &str = "urn:oasis:names:tc:SAML:2.0:status:AuthnFailed";
pub const STATUS_REQUEST_UNSUPPORTED: &str =
    "urn:oasis:names:tc:SAML:2.0:status:RequestUnsupported";

const NAMEID_UNSPECIFIED: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// SAML 2.0 protocol messages this IdP recognizes as envelope content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AuthnRequest,
    ArtifactResolve,
    AttributeQuery,
    AuthzDecisionQuery,
    AssertionIdRequest,
    LogoutRequest,
    ManageNameIdRequest,
    NameIdMappingRequest,
    Response,
    ArtifactResponse,
    LogoutResponse,
}

impl MessageKind {
    const ALL: [MessageKind; 11] = [
        MessageKind::AuthnRequest,
        MessageKind::ArtifactResolve,
        MessageKind::AttributeQuery,
        MessageKind::AuthzDecisionQuery,
        MessageKind::AssertionIdRequest,
        MessageKind::LogoutRequest,
        MessageKind::ManageNameIdRequest,
        MessageKind::NameIdMappingRequest,
        MessageKind::Response,
        MessageKind::ArtifactResponse,
        MessageKind::LogoutResponse,
    ];

    /// Element local name in the protocol namespace.
    pub fn local_name(self) -> &'static str {
        match self {
            MessageKind::AuthnRequest => "AuthnRequest",
            MessageKind::ArtifactResolve => "ArtifactResolve",
            MessageKind::AttributeQuery => "AttributeQuery",
            MessageKind::AuthzDecisionQuery => "AuthzDecisionQuery",
            MessageKind::AssertionIdRequest => "AssertionIDRequest",
            MessageKind::LogoutRequest => "LogoutRequest",
            MessageKind::ManageNameIdRequest => "ManageNameIDRequest",
            MessageKind::NameIdMappingRequest => "NameIDMappingRequest",
            MessageKind::Response => "Response",
            MessageKind::ArtifactResponse => "ArtifactResponse",
            MessageKind::LogoutResponse => "LogoutResponse",
        }
    }

    pub fn from_name(name: &ExpandedName) -> Option<Self> {
        if name.namespace() != Some(SAML2_PROTOCOL_NS) {
            return None;
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.local_name() == name.local())
    }

    pub fn is_request(self) -> bool {
        !matches!(
            self,
            MessageKind::Response | MessageKind::ArtifactResponse | MessageKind::LogoutResponse
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.local_name())
    }
}

/// One recognized protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlMessage {
    pub kind: MessageKind,
    pub name: ExpandedName,
    pub xml: String,
}

impl SamlMessage {
    /// Classify an envelope body child.
    pub fn from_child(child: &BodyChild) -> Result<Self, DecodeError> {
        let kind = MessageKind::from_name(&child.name)
            .ok_or_else(|| DecodeError::UnexpectedContent(child.name.to_string()))?;
        Ok(Self {
            kind,
            name: child.name.clone(),
            xml: child.xml.clone(),
        })
    }

    /// Classify a standalone XML document by its root element.
    pub fn parse(xml: String) -> Result<Self, DecodeError> {
        let name = root_element_name(&xml)?;
        let kind = MessageKind::from_name(&name)
            .ok_or_else(|| DecodeError::UnexpectedContent(name.to_string()))?;
        Ok(Self { kind, name, xml })
    }

    pub fn header(&self) -> Result<MessageHeader, DecodeError> {
        parse_message_header(&self.xml)
    }
}

fn message_error(message: impl fmt::Display) -> DecodeError {
    DecodeError::MalformedEnvelope(format!("protocol message: {message}"))
}

fn root_element_name(xml: &str) -> Result<ExpandedName, DecodeError> {
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(true);
    loop {
        let (resolved, event) = reader.read_resolved_event().map_err(message_error)?;
        let namespace = match resolved {
            ResolveResult::Bound(Namespace(ns)) => Some(String::from_utf8_lossy(ns).into_owned()),
            ResolveResult::Unbound => None,
            ResolveResult::Unknown(prefix) => {
                return Err(message_error(format!(
                    "undeclared namespace prefix {}",
                    String::from_utf8_lossy(&prefix)
                )))
            }
        };
        match event {
            Event::Start(e) | Event::Empty(e) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                return Ok(match namespace {
                    Some(ns) => ExpandedName::new(ns, local),
                    None => ExpandedName::unqualified(local),
                });
            }
            Event::DocType(_) => {
                return Err(message_error("document type declarations are not allowed"))
            }
            Event::Text(_) | Event::CData(_) => {
                return Err(message_error("text before the root element"))
            }
            Event::Eof => return Err(message_error("empty document")),
            _ => {}
        }
    }
}

/// Header fields common to SAML requests and responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: Option<String>,
    pub issuer: Option<String>,
    pub issue_instant: Option<DateTime<Utc>>,
    pub destination: Option<String>,
    pub assertion_consumer_service_url: Option<String>,
}

/// Read the root attributes and the top-level `Issuer` of a message.
///
/// Prefixes are matched by local name only, so fragments cut out of an
/// envelope parse without their inherited namespace declarations.
pub fn parse_message_header(xml: &str) -> Result<MessageHeader, DecodeError> {
    let mut reader = Reader::from_str(xml);

    let mut header = MessageHeader::default();
    let mut depth = 0usize;
    // Text of the top-level Issuer, which may arrive in several pieces.
    let mut issuer: Option<String> = None;
    loop {
        match reader.read_event().map_err(message_error)? {
            Event::Start(e) => {
                if depth == 0 {
                    read_root_attributes(&e, &mut header)?;
                } else if depth == 1
                    && header.issuer.is_none()
                    && e.local_name().as_ref() == b"Issuer"
                {
                    issuer = Some(String::new());
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if depth == 0 {
                    read_root_attributes(&e, &mut header)?;
                    break;
                }
            }
            Event::Text(t) => {
                if let Some(text) = issuer.as_mut() {
                    text.push_str(&t.unescape().map_err(message_error)?);
                }
            }
            Event::CData(c) => {
                if let Some(text) = issuer.as_mut() {
                    let bytes = c.into_inner();
                    text.push_str(std::str::from_utf8(&bytes).map_err(message_error)?);
                }
            }
            Event::End(_) => {
                if let Some(text) = issuer.take() {
                    let text = text.trim();
                    if !text.is_empty() {
                        header.issuer = Some(text.to_string());
                    }
                }
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
            Event::DocType(_) => {
                return Err(message_error("document type declarations are not allowed"))
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(header)
}

fn read_root_attributes(
    start: &BytesStart<'_>,
    header: &mut MessageHeader,
) -> Result<(), DecodeError> {
    for attr in start.attributes() {
        let attr = attr.map_err(message_error)?;
        if attr.key.prefix().is_some() {
            continue;
        }
        let value = attr.unescape_value().map_err(message_error)?.into_owned();
        match attr.key.local_name().as_ref() {
            b"ID" => header.id = Some(value),
            b"Destination" => header.destination = Some(value),
            b"AssertionConsumerServiceURL" => {
                header.assertion_consumer_service_url = Some(value)
            }
            b"IssueInstant" => {
                let instant = DateTime::parse_from_rfc3339(&value)
                    .map_err(|e| message_error(format!("bad IssueInstant {value:?}: {e}")))?;
                header.issue_instant = Some(instant.with_timezone(&Utc));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Generate IdP metadata XML.
pub fn generate_metadata(entity_id: &str, sso_url: &str, soap_url: &str) -> String {
    let entity_id = escape(entity_id);
    let sso_url = escape(sso_url);
    let soap_url = escape(soap_url);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata"
                     entityID="{entity_id}">
  <md:IDPSSODescriptor WantAuthnRequestsSigned="false"
                       protocolSupportEnumeration="{SAML2_PROTOCOL_NS}">
    <md:NameIDFormat>{NAMEID_UNSPECIFIED}</md:NameIDFormat>
    <md:SingleSignOnService Binding="{BINDING_HTTP_REDIRECT}"
                            Location="{sso_url}"/>
  </md:IDPSSODescriptor>
  <md:PDPDescriptor protocolSupportEnumeration="{SAML2_PROTOCOL_NS}">
    <md:AuthzService Binding="{BINDING_SOAP}"
                     Location="{soap_url}"/>
  </md:PDPDescriptor>
</md:EntityDescriptor>"#
    )
}

/// Build an unsigned SAML 2.0 success response carrying one assertion.
pub fn build_saml_response(
    principal: &Principal,
    entity_id: &str,
    acs_url: &str,
    audience: &str,
    request_id: Option<&str>,
    lifetime: Duration,
) -> String {
    let response_id = format!("_resp_{}", Uuid::new_v4().simple());
    let assertion_id = format!("_assert_{}", Uuid::new_v4().simple());
    let now = Utc::now();
    let issue_instant = now.format(TIMESTAMP_FORMAT).to_string();
    let not_on_or_after = (now + lifetime).format(TIMESTAMP_FORMAT).to_string();

    let entity_id = escape(entity_id);
    let acs_url = escape(acs_url);
    let audience = escape(audience);
    let username = escape(principal.username.as_str());
    let in_response_to = in_response_to(request_id);

    let attributes = if principal.groups.is_empty() {
        String::new()
    } else {
        let values: String = principal
            .groups
            .iter()
            .map(|g| format!("<saml:AttributeValue>{}</saml:AttributeValue>", escape(g.as_str())))
            .collect();
        format!(
            r#"
    <saml:AttributeStatement>
      <saml:Attribute Name="verified_groups">{values}</saml:Attribute>
    </saml:AttributeStatement>"#
        )
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:Response xmlns:samlp="{SAML2_PROTOCOL_NS}"
                xmlns:saml="{SAML2_ASSERTION_NS}"
                ID="{response_id}"
                Version="2.0"
                IssueInstant="{issue_instant}"
                Destination="{acs_url}"{in_response_to}>
  <saml:Issuer>{entity_id}</saml:Issuer>
  <samlp:Status>
    <samlp:StatusCode Value="{STATUS_SUCCESS}"/>
  </samlp:Status>
  <saml:Assertion Version="2.0"
                  ID="{assertion_id}"
                  IssueInstant="{issue_instant}">
    <saml:Issuer>{entity_id}</saml:Issuer>
    <saml:Subject>
      <saml:NameID Format="{NAMEID_UNSPECIFIED}">{username}</saml:NameID>
      <saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">
        <saml:SubjectConfirmationData NotOnOrAfter="{not_on_or_after}"
                                      Recipient="{acs_url}"{in_response_to}/>
      </saml:SubjectConfirmation>
    </saml:Subject>
    <saml:Conditions NotBefore="{issue_instant}" NotOnOrAfter="{not_on_or_after}">
      <saml:AudienceRestriction>
        <saml:Audience>{audience}</saml:Audience>
      </saml:AudienceRestriction>
    </saml:Conditions>
    <saml:AuthnStatement AuthnInstant="{issue_instant}">
      <saml:AuthnContext>
        <saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef>
      </saml:AuthnContext>
    </saml:AuthnStatement>{attributes}
  </saml:Assertion>
</samlp:Response>"#
    )
}

/// Build a SAML 2.0 response with a non-success status and no assertion.
///
/// `second_level` is nested under the top-level code when present.
pub fn build_status_response(
    entity_id: &str,
    destination: Option<&str>,
    request_id: Option<&str>,
    status_code: &str,
    second_level: Option<&str>,
    message: &str,
) -> String {
    let response_id = format!("_resp_{}", Uuid::new_v4().simple());
    let issue_instant = Utc::now().format(TIMESTAMP_FORMAT).to_string();
    let entity_id = escape(entity_id);
    let destination = destination
        .map(|d| format!(r#" Destination="{}""#, escape(d)))
        .unwrap_or_default();
    let in_response_to = in_response_to(request_id);
    let message = escape(message);
    let status_code = match second_level {
        Some(inner) => format!(
            r#"<samlp:StatusCode Value="{status_code}"><samlp:StatusCode Value="{inner}"/></samlp:StatusCode>"#
        ),
        None => format!(r#"<samlp:StatusCode Value="{status_code}"/>"#),
    };

    format!(
        r#"<samlp:Response xmlns:samlp="{SAML2_PROTOCOL_NS}" xmlns:saml="{SAML2_ASSERTION_NS}" ID="{response_id}" Version="2.0" IssueInstant="{issue_instant}"{destination}{in_response_to}><saml:Issuer>{entity_id}</saml:Issuer><samlp:Status>{status_code}<samlp:StatusMessage>{message}</samlp:StatusMessage></samlp:Status></samlp:Response>"#
    )
}

/// Failure response posted back to the service provider when authentication
/// ends without a principal.
pub fn build_saml_failure_response(
    entity_id: &str,
    acs_url: &str,
    request_id: Option<&str>,
    message: &str,
) -> String {
    build_status_response(
        entity_id,
        Some(acs_url),
        request_id,
        STATUS_RESPONDER,
        Some(STATUS_AUTHN_FAILED),
        message,
    )
}

fn in_response_to(request_id: Option<&str>) -> String {
    request_id
        .map(|id| format!(r#" InResponseTo="{}""#, escape(id)))
        .unwrap_or_default()
}
