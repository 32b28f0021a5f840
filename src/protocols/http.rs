//! The HTTP probe stream.
//!
//! The hello is a templated request rendered from configurable parts. All
//! the pieces can be overridden through the table's configuration surface
//! before the scan starts.

use std::borrow::Cow;
use std::sync::RwLock;

use crate::banner::{BannerOutput, BannerScratch};
use crate::protocols::ProtocolParser;
use crate::table::NetApi;

/// The parts of the request we send to HTTP servers.
#[derive(Debug, Clone)]
pub struct HttpTemplate {
    pub method: String,
    pub url: String,
    /// Version suffix after "HTTP/", e.g. "1.0"
    pub version: String,
    /// Host header value; omitted when empty
    pub host: String,
    pub user_agent: String,
    /// Extra headers in insertion order
    headers: Vec<(String, String)>,
    /// Body appended after the blank line
    pub payload: Vec<u8>,
}

impl Default for HttpTemplate {
    fn default() -> Self {
        Self {
            method: "GET".into(),
            url: "/".into(),
            version: "1.0".into(),
            host: String::new(),
            user_agent: concat!("strobe/", env!("CARGO_PKG_VERSION")).into(),
            headers: Vec::new(),
            payload: Vec::new(),
        }
    }
}

impl HttpTemplate {
    /// Adds or replaces a header. Host and User-Agent route to their
    /// dedicated fields so they are never emitted twice.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("host") {
            self.host = value.into();
            return;
        }
        if name.eq_ignore_ascii_case("user-agent") {
            self.user_agent = value.into();
            return;
        }
        if let Some(existing) = self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            existing.1 = value.into();
        } else {
            self.headers.push((name.into(), value.into()));
        }
    }

    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.url.as_bytes());
        out.extend_from_slice(b" HTTP/");
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(b"\r\n");
        if !self.host.is_empty() {
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(self.host.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"User-Agent: ");
        out.extend_from_slice(self.user_agent.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.payload);
        out
    }
}

#[derive(Debug, Default)]
pub struct HttpStream {
    template: RwLock<HttpTemplate>,
}

impl HttpStream {
    pub fn configure(&self, mutate: impl FnOnce(&mut HttpTemplate)) {
        mutate(&mut self.template.write().unwrap());
    }
}

impl ProtocolParser for HttpStream {
    fn name(&self) -> &'static str {
        "http"
    }

    fn hello(&self) -> Option<Cow<'static, [u8]>> {
        Some(Cow::Owned(self.template.read().unwrap().render()))
    }

    fn parse(
        &self,
        _scratch: &mut BannerScratch,
        payload: &[u8],
        banner: &mut BannerOutput,
        _net: &mut NetApi,
    ) {
        banner.append(self.name(), payload);
    }
}
