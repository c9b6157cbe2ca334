//! In-process CardDAV server used by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{anyhow, Result};
use quick_xml::escape::{escape, unescape};

use crate::remote::{DavMethod, DavRequest, Transport};

#[derive(Default)]
pub struct FakeServer {
    cards: RefCell<BTreeMap<String, (String, String)>>,
    ctag: RefCell<Option<String>>,
    display_name: RefCell<Option<String>>,
    failing: RefCell<HashSet<&'static str>>,
    raw: RefCell<HashMap<&'static str, String>>,
    fail_multiget_from: Cell<Option<usize>>,
    multigets: Cell<usize>,
    requests: RefCell<Vec<DavRequest>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_card(&self, href: &str, etag: &str, vcard: &str) {
        self.cards
            .borrow_mut()
            .insert(href.to_string(), (etag.to_string(), vcard.to_string()));
    }

    pub fn remove_card(&self, href: &str) {
        self.cards.borrow_mut().remove(href);
    }

    pub fn set_ctag(&self, ctag: Option<&str>) {
        *self.ctag.borrow_mut() = ctag.map(str::to_string);
    }

    pub fn set_display_name(&self, name: Option<&str>) {
        *self.display_name.borrow_mut() = name.map(str::to_string);
    }

    /// Every request with this method fails at the transport level.
    pub fn fail_method(&self, method: DavMethod) {
        self.failing.borrow_mut().insert(method.as_str());
    }

    /// Multiget number `n` (0-based) and every later one fail.
    pub fn fail_multiget_from(&self, n: usize) {
        self.fail_multiget_from.set(Some(n));
    }

    /// Answer every request with this method with a fixed body.
    pub fn respond_raw(&self, method: DavMethod, body: &str) {
        self.raw.borrow_mut().insert(method.as_str(), body.to_string());
    }

    pub fn requests(&self) -> Vec<DavRequest> {
        self.requests.borrow().clone()
    }

    pub fn multiget_requests(&self) -> Vec<DavRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.body.contains("addressbook-multiget"))
            .collect()
    }

    pub fn clear_requests(&self) {
        self.requests.borrow_mut().clear();
    }

    fn propfind_body(&self) -> String {
        let mut props = String::new();
        if let Some(ctag) = self.ctag.borrow().as_deref() {
            props.push_str(&format!("<cs:getctag>{}</cs:getctag>", escape(ctag)));
        }
        if let Some(name) = self.display_name.borrow().as_deref() {
            props.push_str(&format!("<d:displayname>{}</d:displayname>", escape(name)));
        }
        format!(
            r#"<d:multistatus xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/"><d:response><d:href>/ab/</d:href><d:propstat><d:prop>{}</d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response></d:multistatus>"#,
            props
        )
    }

    fn listing_body(&self) -> String {
        let mut out = String::from(r#"<d:multistatus xmlns:d="DAV:">"#);
        for (href, (etag, _)) in self.cards.borrow().iter() {
            out.push_str(&format!(
                "<d:response><d:href>{}</d:href><d:propstat><d:prop><d:getetag>{}</d:getetag></d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>",
                escape(href.as_str()),
                escape(etag.as_str())
            ));
        }
        out.push_str("</d:multistatus>");
        out
    }

    fn multiget_body(&self, request: &DavRequest) -> Result<String> {
        let index = self.multigets.get();
        self.multigets.set(index + 1);
        if matches!(self.fail_multiget_from.get(), Some(n) if index >= n) {
            return Err(anyhow!("connection reset by peer"));
        }

        let mut out = String::from(
            r#"<d:multistatus xmlns:d="DAV:" xmlns:card="urn:ietf:params:xml:ns:carddav">"#,
        );
        let cards = self.cards.borrow();
        for href in requested_hrefs(&request.body)? {
            match cards.get(&href) {
                Some((etag, vcard)) => out.push_str(&format!(
                    "<d:response><d:href>{}</d:href><d:propstat><d:prop><d:getetag>{}</d:getetag><card:address-data>{}</card:address-data></d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>",
                    escape(href.as_str()),
                    escape(etag.as_str()),
                    escape(vcard.as_str())
                )),
                None => out.push_str(&format!(
                    "<d:response><d:href>{}</d:href><d:status>HTTP/1.1 404 Not Found</d:status></d:response>",
                    escape(href.as_str())
                )),
            }
        }
        out.push_str("</d:multistatus>");
        Ok(out)
    }
}

fn requested_hrefs(body: &str) -> Result<Vec<String>> {
    let mut hrefs = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("<d:href>") {
        let after = &rest[start + "<d:href>".len()..];
        let end = after
            .find("</d:href>")
            .ok_or_else(|| anyhow!("unterminated href in multiget body"))?;
        hrefs.push(unescape(&after[..end])?.into_owned());
        rest = &after[end..];
    }
    Ok(hrefs)
}

impl Transport for FakeServer {
    fn perform(&self, request: &DavRequest) -> Result<Vec<u8>> {
        self.requests.borrow_mut().push(request.clone());

        let method = request.method.as_str();
        if self.failing.borrow().contains(method) {
            return Err(anyhow!("connection refused"));
        }
        if let Some(body) = self.raw.borrow().get(method) {
            return Ok(body.clone().into_bytes());
        }

        let body = match request.method {
            DavMethod::Propfind => self.propfind_body(),
            DavMethod::Report if request.body.contains("addressbook-multiget") => {
                self.multiget_body(request)?
            }
            DavMethod::Report => self.listing_body(),
        };
        Ok(body.into_bytes())
    }
}
