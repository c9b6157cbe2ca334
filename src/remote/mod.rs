//! Remote server access for CardDAV address books.
//!
//! This module provides:
//! - `Transport` trait abstracting the raw HTTP round trip
//! - `HttpTransport`, the blocking reqwest implementation
//! - `CardDavClient`, which builds the PROPFIND/REPORT requests the mirror issues
//! - a reader for multistatus response bodies

pub mod carddav;
pub mod http;
pub mod multistatus;

#[cfg(test)]
pub mod fake;

use std::fmt;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// HTTP methods issued against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavMethod {
    Propfind,
    Report,
}

impl DavMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DavMethod::Propfind => "PROPFIND",
            DavMethod::Report => "REPORT",
        }
    }
}

impl fmt::Display for DavMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully built request, ready to hand to a [`Transport`].
#[derive(Clone)]
pub struct DavRequest {
    pub method: DavMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl DavRequest {
    /// Value of the first header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl fmt::Debug for DavRequest {
    // Never print Authorization.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DavRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("depth", &self.header("Depth"))
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Raw request/response round trip.
pub trait Transport {
    /// Send the request and return the response body.
    ///
    /// Non-success statuses are errors.
    fn perform(&self, request: &DavRequest) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn perform(&self, request: &DavRequest) -> Result<Vec<u8>> {
        (**self).perform(request)
    }
}

/// Basic-auth credentials for one external source.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Basic <base64(username:password)>`
    pub fn authorization_header(&self) -> String {
        let plain = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(plain))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
