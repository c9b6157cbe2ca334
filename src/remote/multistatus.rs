//! Reader for WebDAV `multistatus` response bodies.
//!
//! Only the handful of properties the mirror needs are extracted. Each
//! `DAV:response` becomes one [`DavResponse`]; properties a response does
//! not carry are left empty.

use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;

pub const DAV_NS: &str = "DAV:";
pub const CARDDAV_NS: &str = "urn:ietf:params:xml:ns:carddav";
pub const CALENDARSERVER_NS: &str = "http://calendarserver.org/ns/";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    Xml(String),
    #[error("response body is not a DAV:multistatus document")]
    NotMultistatus,
}

impl From<quick_xml::Error> for ParseError {
    fn from(err: quick_xml::Error) -> Self {
        Self::Xml(err.to_string())
    }
}

/// One `DAV:response` element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavResponse {
    pub href: String,
    pub etag: String,
    /// Raw vCard text from `carddav:address-data`.
    pub address_data: String,
    pub ctag: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct Multistatus {
    pub responses: Vec<DavResponse>,
}

impl Multistatus {
    /// First non-empty `cs:getctag` in the document.
    pub fn ctag(&self) -> Option<&str> {
        self.responses
            .iter()
            .map(|r| r.ctag.as_str())
            .find(|v| !v.is_empty())
    }

    pub fn display_name(&self) -> Option<&str> {
        self.responses
            .iter()
            .map(|r| r.display_name.as_str())
            .find(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Multistatus,
    Response,
    Href,
    Etag,
    AddressData,
    Ctag,
    DisplayName,
}

fn classify(ns: &ResolveResult<'_>, local: &[u8]) -> Option<Element> {
    let ResolveResult::Bound(Namespace(uri)) = ns else {
        return None;
    };
    let uri = std::str::from_utf8(uri).ok()?;
    match (uri, local) {
        (DAV_NS, b"multistatus") => Some(Element::Multistatus),
        (DAV_NS, b"response") => Some(Element::Response),
        (DAV_NS, b"href") => Some(Element::Href),
        (DAV_NS, b"getetag") => Some(Element::Etag),
        (DAV_NS, b"displayname") => Some(Element::DisplayName),
        (CARDDAV_NS, b"address-data") => Some(Element::AddressData),
        (CALENDARSERVER_NS, b"getctag") => Some(Element::Ctag),
        _ => None,
    }
}

fn field_mut(response: &mut DavResponse, element: Element) -> Option<&mut String> {
    match element {
        Element::Href => Some(&mut response.href),
        Element::Etag => Some(&mut response.etag),
        Element::AddressData => Some(&mut response.address_data),
        Element::Ctag => Some(&mut response.ctag),
        Element::DisplayName => Some(&mut response.display_name),
        Element::Multistatus | Element::Response => None,
    }
}

/// Parses a multistatus body.
///
/// Namespace prefixes are resolved, so `D:getetag`, `d:getetag` and a
/// default-namespaced `getetag` all match. Text inside a captured property
/// is unescaped and CDATA sections are appended verbatim.
pub fn parse_multistatus(xml: &[u8]) -> Result<Multistatus, ParseError> {
    let mut reader = NsReader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut out = Multistatus::default();
    let mut seen_root = false;
    let mut depth = 0usize;
    let mut current: Option<(DavResponse, usize)> = None;
    let mut capturing: Option<(Element, usize)> = None;

    loop {
        match reader.read_resolved_event_into(&mut buf) {
            Ok((ns, Event::Start(e))) => {
                depth += 1;
                match classify(&ns, e.local_name().as_ref()) {
                    Some(Element::Multistatus) => seen_root = true,
                    Some(Element::Response) => {
                        current = Some((DavResponse::default(), depth));
                    }
                    // href is only meaningful as a direct child of response
                    Some(Element::Href) => {
                        if let Some((_, response_depth)) = &current {
                            if depth == response_depth + 1 && capturing.is_none() {
                                capturing = Some((Element::Href, depth));
                            }
                        }
                    }
                    Some(element) => {
                        if current.is_some() && capturing.is_none() {
                            capturing = Some((element, depth));
                        }
                    }
                    None => {}
                }
            }
            Ok((ns, Event::Empty(e))) => {
                if classify(&ns, e.local_name().as_ref()) == Some(Element::Multistatus) {
                    seen_root = true;
                }
            }
            Ok((_, Event::Text(e))) => {
                if let (Some((response, _)), Some((element, _))) = (current.as_mut(), capturing) {
                    let text = e.unescape()?;
                    if let Some(field) = field_mut(response, element) {
                        field.push_str(&text);
                    }
                }
            }
            Ok((_, Event::CData(e))) => {
                if let (Some((response, _)), Some((element, _))) = (current.as_mut(), capturing) {
                    let raw = e.into_inner();
                    let text = String::from_utf8_lossy(&raw);
                    if let Some(field) = field_mut(response, element) {
                        field.push_str(&text);
                    }
                }
            }
            Ok((_, Event::End(_))) => {
                if matches!(capturing, Some((_, d)) if d == depth) {
                    capturing = None;
                }
                if matches!(&current, Some((_, d)) if *d == depth) {
                    if let Some((response, _)) = current.take() {
                        out.responses.push(response);
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok((_, Event::Eof)) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }

    if !seen_root {
        return Err(ParseError::NotMultistatus);
    }
    Ok(out)
}
