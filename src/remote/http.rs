//! Blocking HTTP transport built on reqwest.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::Method;

use crate::remote::{DavRequest, Transport};

/// Connection timeout applied when the configuration does not override it.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(40);

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// `request_timeout` bounds a whole request. The blocking client
    /// otherwise defaults to 30 seconds, so `None` is passed through
    /// explicitly to turn that off.
    pub fn new(connect_timeout: Duration, request_timeout: Option<Duration>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .user_agent(concat!("carddav-mirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn perform(&self, request: &DavRequest) -> Result<Vec<u8>> {
        let method = Method::from_bytes(request.method.as_str().as_bytes())
            .with_context(|| format!("invalid HTTP method {}", request.method))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send()?;
        let status = response.status();
        if !status.is_success() {
            bail!("server returned HTTP {}", status);
        }

        let body = response
            .bytes()
            .context("failed to read response body")?;
        Ok(body.to_vec())
    }
}
