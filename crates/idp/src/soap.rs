//! SOAP 1.1 envelope decoding and encoding.
//!
//! [`EnvelopeDecoder`] checks the envelope framing and the `mustUnderstand`
//! header rule and returns the body children in document order, each as a
//! self-contained XML fragment. It does not look at what the children mean.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use axum::http::Method;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;
use thiserror::Error;
use tracing::debug;

use crate::error::DecodeError;

/// Namespace of SOAP 1.1 envelope elements and attributes.
pub const SOAP11_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// An XML name qualified by its namespace URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExpandedName {
    namespace: Option<String>,
    local: String,
}

impl ExpandedName {
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            local: local.into(),
        }
    }

    pub fn unqualified(local: impl Into<String>) -> Self {
        Self {
            namespace: None,
            local: local.into(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.namespace.as_deref() == Some(namespace) && self.local == local
    }
}

/// Clark notation: `{namespace}local`, or `local` when unqualified.
impl fmt::Display for ExpandedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{{{ns}}}{}", self.local),
            None => f.write_str(&self.local),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid expanded name: {0}")]
pub struct InvalidName(pub String);

impl FromStr for ExpandedName {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix('{') {
            return match rest.split_once('}') {
                Some((ns, local))
                    if !ns.is_empty() && !local.is_empty() && !local.contains('}') =>
                {
                    Ok(Self::new(ns, local))
                }
                _ => Err(InvalidName(s.to_string())),
            };
        }
        if s.is_empty() || s.contains(['{', '}']) {
            return Err(InvalidName(s.to_string()));
        }
        Ok(Self::unqualified(s))
    }
}

/// One child of the SOAP `Header` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    pub name: ExpandedName,
    pub must_understand: bool,
}

/// One child of the SOAP `Body` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyChild {
    pub name: ExpandedName,
    /// The element's own markup. Namespace declarations inherited from the
    /// envelope are not copied in; `name` carries the resolved namespace.
    pub xml: String,
}

/// A decoded SOAP 1.1 envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub headers: Vec<HeaderBlock>,
    pub body: Vec<BodyChild>,
}

/// Decoder for the SOAP 1.1 over HTTP binding.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeDecoder {
    understood: HashSet<ExpandedName>,
}

impl EnvelopeDecoder {
    pub fn new(understood: impl IntoIterator<Item = ExpandedName>) -> Self {
        Self {
            understood: understood.into_iter().collect(),
        }
    }

    /// Build a decoder from Clark-notation header names.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, InvalidName> {
        let understood = names
            .iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(Self { understood })
    }

    pub fn understands(&self, name: &ExpandedName) -> bool {
        self.understood.contains(name)
    }

    /// Decode the envelope carried in an HTTP request body.
    pub fn decode(&self, method: &Method, body: &[u8]) -> Result<Envelope, DecodeError> {
        if method != Method::POST {
            return Err(DecodeError::UnsupportedTransport(format!(
                "this binding only supports HTTP POST, got {method}"
            )));
        }
        let text = std::str::from_utf8(body)
            .map_err(|e| DecodeError::MalformedEnvelope(format!("body is not UTF-8: {e}")))?;

        debug!("unmarshalling SOAP message");
        let envelope = parse_envelope(text)?;
        self.check_understood_headers(&envelope.headers)?;
        debug!(
            headers = envelope.headers.len(),
            messages = envelope.body.len(),
            "decoded SOAP envelope"
        );
        Ok(envelope)
    }

    fn check_understood_headers(&self, headers: &[HeaderBlock]) -> Result<(), DecodeError> {
        match headers
            .iter()
            .find(|h| h.must_understand && !self.understands(&h.name))
        {
            Some(header) => Err(DecodeError::HeaderNotUnderstood(header.name.to_string())),
            None => Ok(()),
        }
    }
}

fn malformed(message: impl Into<String>) -> DecodeError {
    DecodeError::MalformedEnvelope(message.into())
}

fn read_event<'i>(
    reader: &mut NsReader<&'i [u8]>,
) -> Result<(Option<String>, Event<'i>), DecodeError> {
    let (resolved, event) = reader
        .read_resolved_event()
        .map_err(|e| malformed(format!("XML parse error: {e}")))?;
    let namespace = match resolved {
        ResolveResult::Bound(Namespace(ns)) => Some(String::from_utf8_lossy(ns).into_owned()),
        ResolveResult::Unbound => None,
        ResolveResult::Unknown(prefix) => {
            return Err(malformed(format!(
                "undeclared namespace prefix {}",
                String::from_utf8_lossy(&prefix)
            )))
        }
    };
    Ok((namespace, event))
}

fn element_name(namespace: Option<String>, start: &BytesStart<'_>) -> ExpandedName {
    ExpandedName {
        namespace,
        local: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
    }
}

/// Consume events up to and including the end tag of an already-opened element.
fn skip_element(reader: &mut NsReader<&[u8]>) -> Result<(), DecodeError> {
    let mut depth = 1usize;
    loop {
        match reader
            .read_event()
            .map_err(|e| malformed(format!("XML parse error: {e}")))?
        {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            Event::Eof => return Err(malformed("unexpected end of document")),
            _ => {}
        }
    }
}

fn parse_envelope(text: &str) -> Result<Envelope, DecodeError> {
    let mut reader = NsReader::from_str(text);
    reader.config_mut().trim_text(true);

    let (root, root_is_empty) = loop {
        let (namespace, event) = read_event(&mut reader)?;
        match event {
            Event::Start(e) => break (element_name(namespace, &e), false),
            Event::Empty(e) => break (element_name(namespace, &e), true),
            Event::DocType(_) => {
                return Err(malformed("document type declarations are not allowed"))
            }
            Event::Text(_) | Event::CData(_) => {
                return Err(malformed("text before the root element"))
            }
            Event::Eof => return Err(malformed("empty document")),
            _ => {}
        }
    };
    if root.local() == "Envelope" && root.namespace() != Some(SOAP11_ENV_NS) {
        return Err(DecodeError::VersionMismatch(root.to_string()));
    }
    if !root.is(SOAP11_ENV_NS, "Envelope") {
        return Err(malformed(format!(
            "root element {root} is not a SOAP 1.1 Envelope"
        )));
    }
    if root_is_empty {
        return Err(malformed("envelope has no Body"));
    }

    let mut headers: Option<Vec<HeaderBlock>> = None;
    let mut body: Option<Vec<BodyChild>> = None;
    loop {
        let (namespace, event) = read_event(&mut reader)?;
        let (name, is_empty) = match &event {
            Event::Start(e) => (element_name(namespace, e), false),
            Event::Empty(e) => (element_name(namespace, e), true),
            Event::End(_) => break,
            Event::Eof => return Err(malformed("unexpected end of document inside Envelope")),
            Event::Text(_) | Event::CData(_) => {
                return Err(malformed("unexpected text inside Envelope"))
            }
            _ => continue,
        };

        if name.is(SOAP11_ENV_NS, "Header") {
            if headers.is_some() || body.is_some() {
                return Err(malformed("Header must appear once, before Body"));
            }
            headers = Some(if is_empty {
                Vec::new()
            } else {
                read_header_blocks(&mut reader)?
            });
        } else if name.is(SOAP11_ENV_NS, "Body") {
            if body.is_some() {
                return Err(malformed("Body must appear exactly once"));
            }
            body = Some(if is_empty {
                Vec::new()
            } else {
                read_body_children(&mut reader, text)?
            });
        } else {
            return Err(malformed(format!("unexpected element {name} inside Envelope")));
        }
    }

    loop {
        let (_, event) = read_event(&mut reader)?;
        match event {
            Event::Eof => break,
            Event::Start(_) | Event::Empty(_) | Event::Text(_) | Event::CData(_) => {
                return Err(malformed("content after the Envelope"))
            }
            _ => {}
        }
    }

    Ok(Envelope {
        headers: headers.unwrap_or_default(),
        body: body.ok_or_else(|| malformed("envelope has no Body"))?,
    })
}

fn read_header_blocks(reader: &mut NsReader<&[u8]>) -> Result<Vec<HeaderBlock>, DecodeError> {
    let mut blocks = Vec::new();
    loop {
        let (namespace, event) = read_event(reader)?;
        match event {
            Event::Start(e) => {
                blocks.push(header_block(reader, namespace, &e)?);
                skip_element(reader)?;
            }
            Event::Empty(e) => blocks.push(header_block(reader, namespace, &e)?),
            Event::End(_) => return Ok(blocks),
            Event::Eof => return Err(malformed("unexpected end of document inside Header")),
            Event::Text(_) | Event::CData(_) => {
                return Err(malformed("unexpected text inside Header"))
            }
            _ => {}
        }
    }
}

fn header_block(
    reader: &NsReader<&[u8]>,
    namespace: Option<String>,
    start: &BytesStart<'_>,
) -> Result<HeaderBlock, DecodeError> {
    let mut must_understand = false;
    for attr in start.attributes() {
        let attr = attr.map_err(|e| malformed(format!("bad header attribute: {e}")))?;
        let (resolved, local) = reader.resolve_attribute(attr.key);
        let in_soap_ns = matches!(
            resolved,
            ResolveResult::Bound(Namespace(ns)) if ns == SOAP11_ENV_NS.as_bytes()
        );
        if in_soap_ns && local.as_ref() == b"mustUnderstand" {
            let value = attr
                .unescape_value()
                .map_err(|e| malformed(format!("bad mustUnderstand value: {e}")))?;
            must_understand = matches!(value.trim(), "1" | "true");
        }
    }
    Ok(HeaderBlock {
        name: element_name(namespace, start),
        must_understand,
    })
}

fn read_body_children(
    reader: &mut NsReader<&[u8]>,
    text: &str,
) -> Result<Vec<BodyChild>, DecodeError> {
    let mut children = Vec::new();
    loop {
        let before = reader.buffer_position() as usize;
        let (namespace, event) = read_event(reader)?;
        let name = match event {
            Event::Start(e) => {
                let name = element_name(namespace, &e);
                skip_element(reader)?;
                name
            }
            Event::Empty(e) => element_name(namespace, &e),
            Event::End(_) => return Ok(children),
            Event::Eof => return Err(malformed("unexpected end of document inside Body")),
            Event::Text(_) | Event::CData(_) => {
                return Err(malformed("unexpected text inside Body"))
            }
            _ => continue,
        };
        let after = reader.buffer_position() as usize;
        let xml = text
            .get(before..after)
            .ok_or_else(|| malformed("body child spans an invalid range"))?
            .trim()
            .to_string();
        children.push(BodyChild { name, xml });
    }
}

/// SOAP 1.1 fault codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    VersionMismatch,
    MustUnderstand,
    Client,
}

impl FaultCode {
    pub fn for_error(error: &DecodeError) -> Self {
        match error {
            DecodeError::VersionMismatch(_) => FaultCode::VersionMismatch,
            DecodeError::HeaderNotUnderstood(_) => FaultCode::MustUnderstand,
            _ => FaultCode::Client,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FaultCode::VersionMismatch => "VersionMismatch",
            FaultCode::MustUnderstand => "MustUnderstand",
            FaultCode::Client => "Client",
        }
    }
}

/// Wrap already-serialized body children in a SOAP 1.1 envelope.
pub fn encode_envelope<S: AsRef<str>>(children: &[S]) -> String {
    let mut body = String::new();
    for child in children {
        body.push_str(child.as_ref());
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap11:Envelope xmlns:soap11="{SOAP11_ENV_NS}"><soap11:Body>{body}</soap11:Body></soap11:Envelope>"#
    )
}

/// A SOAP 1.1 envelope carrying a single Fault.
pub fn encode_fault(code: FaultCode, reason: &str) -> String {
    let fault = format!(
        "<soap11:Fault><faultcode>soap11:{}</faultcode><faultstring>{}</faultstring></soap11:Fault>",
        code.as_str(),
        escape(reason)
    );
    encode_envelope(&[fault])
}
