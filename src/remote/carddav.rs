//! CardDAV requests issued by the mirror: change-tag PROPFIND, ETag listing
//! and addressbook-multiget.

use quick_xml::escape::escape;
use tracing::debug;

use crate::remote::multistatus::{parse_multistatus, DavResponse, Multistatus, ParseError};
use crate::remote::{Credentials, DavMethod, DavRequest, Transport};

const CTAG_PROPFIND: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<d:propfind xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/">"#,
    r#"<d:prop><cs:getctag/><d:displayname/></d:prop>"#,
    r#"</d:propfind>"#,
);

const ETAG_QUERY: &str = concat!(
    r#"<c:addressbook-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:carddav">"#,
    r#"<d:prop><d:getetag /></d:prop>"#,
    r#"</c:addressbook-query>"#,
);

const MULTIGET_OPEN: &str = concat!(
    r#"<c:addressbook-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:carddav">"#,
    r#"<d:prop><d:getetag /><c:address-data /></d:prop>"#,
);

const MULTIGET_CLOSE: &str = "</c:addressbook-multiget>";

/// Failure talking to the server or reading its answer.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{method} {url} failed: {source:#}")]
    Request {
        method: DavMethod,
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{method} {url} returned an unusable response: {source}")]
    Response {
        method: DavMethod,
        url: String,
        #[source]
        source: ParseError,
    },
}

/// Collection-level properties from the depth-0 PROPFIND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionProps {
    pub ctag: Option<String>,
    pub display_name: Option<String>,
}

/// Prefixes `https://` when the URL carries no scheme.
pub fn normalize_url(url: &str) -> String {
    if url.starts_with("http") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

pub fn multiget_body<S: AsRef<str>>(hrefs: &[S]) -> String {
    let mut body = String::from(MULTIGET_OPEN);
    for href in hrefs {
        body.push_str("<d:href>");
        body.push_str(&escape(href.as_ref()));
        body.push_str("</d:href>");
    }
    body.push_str(MULTIGET_CLOSE);
    body
}

pub struct CardDavClient<T> {
    transport: T,
    credentials: Credentials,
}

impl<T: Transport> CardDavClient<T> {
    pub fn new(transport: T, credentials: Credentials) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    /// Depth-0 PROPFIND for `cs:getctag` and `d:displayname`.
    pub fn fetch_collection_props(&self, url: &str) -> Result<CollectionProps, RemoteError> {
        let doc = self.perform_xml(DavMethod::Propfind, url, CTAG_PROPFIND, "0")?;
        Ok(CollectionProps {
            ctag: doc.ctag().map(str::to_string),
            display_name: doc.display_name().map(str::to_string),
        })
    }

    /// addressbook-query REPORT returning one entry (href + ETag) per member.
    pub fn list_etags(&self, url: &str) -> Result<Vec<DavResponse>, RemoteError> {
        Ok(self
            .perform_xml(DavMethod::Report, url, ETAG_QUERY, "1")?
            .responses)
    }

    /// addressbook-multiget REPORT for exactly the given hrefs.
    pub fn multiget<S: AsRef<str>>(
        &self,
        url: &str,
        hrefs: &[S],
    ) -> Result<Vec<DavResponse>, RemoteError> {
        let body = multiget_body(hrefs);
        Ok(self
            .perform_xml(DavMethod::Report, url, &body, "1")?
            .responses)
    }

    pub fn build_request(&self, method: DavMethod, url: &str, body: &str, depth: &str) -> DavRequest {
        let mut headers = vec![
            (
                "Authorization".to_string(),
                self.credentials.authorization_header(),
            ),
            ("Prefer".to_string(), "return-minimal".to_string()),
            (
                "Content-Type".to_string(),
                "application/xml; charset=utf-8".to_string(),
            ),
        ];
        if body.contains(crate::remote::multistatus::CARDDAV_NS) {
            headers.push(("Accept".to_string(), "text/vcard; version=4.0".to_string()));
        }
        headers.push(("Depth".to_string(), depth.to_string()));

        DavRequest {
            method,
            url: normalize_url(url),
            headers,
            body: body.to_string(),
        }
    }

    fn perform_xml(
        &self,
        method: DavMethod,
        url: &str,
        body: &str,
        depth: &str,
    ) -> Result<Multistatus, RemoteError> {
        let request = self.build_request(method, url, body, depth);
        debug!(?request, "sending DAV request");

        let raw = self
            .transport
            .perform(&request)
            .map_err(|source| RemoteError::Request {
                method,
                url: request.url.clone(),
                source,
            })?;

        parse_multistatus(&raw).map_err(|source| RemoteError::Response {
            method,
            url: request.url,
            source,
        })
    }
}
