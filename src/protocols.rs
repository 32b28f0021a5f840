//! Application-protocol streams.
//!
//! A [`ProtocolParser`] is the engine's view of one application protocol:
//! where its hello comes from, how received bytes turn into banner evidence,
//! and whether the target deserves a second probe with an alternate
//! protocol. The engine treats parsers as opaque; everything
//! protocol-specific lives behind this trait.

use std::borrow::Cow;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use crate::banner::{BannerOutput, BannerScratch};
use crate::table::NetApi;

pub mod http;
pub mod smb;
pub mod tls;

pub use http::HttpStream;
pub use smb::SmbStream;
pub use tls::TlsStream;

pub trait ProtocolParser: Send + Sync {
    /// Short protocol tag used on banner fragments.
    fn name(&self) -> &'static str;

    /// Canned hello bytes, if the protocol has a fixed request. The engine
    /// sends these as a single segment, closing our half of the connection
    /// behind them.
    fn hello(&self) -> Option<Cow<'static, [u8]>> {
        None
    }

    /// Protocol-driven hello transmission. Returns true if the stream sent
    /// something itself; otherwise the engine falls back to [`hello`].
    ///
    /// [`hello`]: ProtocolParser::hello
    fn transmit_hello(&self, _scratch: &mut BannerScratch, _net: &mut NetApi) -> bool {
        false
    }

    /// Digest received payload bytes into banner evidence. The stream may
    /// also write follow-up application data through `net`.
    fn parse(
        &self,
        scratch: &mut BannerScratch,
        payload: &[u8],
        banner: &mut BannerOutput,
        net: &mut NetApi,
    );

    /// An alternate protocol worth probing on a fresh connection to the
    /// same target.
    fn next(&self) -> Option<Arc<dyn ProtocolParser>> {
        None
    }

    /// Teardown hook for per-connection scratch state.
    fn cleanup(&self, _scratch: &mut BannerScratch) {}
}

/// Collects whatever the server volunteers. Used for ports with no
/// registered stream; many services announce themselves unprompted.
#[derive(Debug, Default)]
pub struct PassiveStream;

impl ProtocolParser for PassiveStream {
    fn name(&self) -> &'static str {
        "unknown"
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

/// A user-configured opaque hello for one port (`hello-string[port]`).
#[derive(Debug)]
pub struct RawStream {
    hello: Vec<u8>,
}

impl RawStream {
    pub fn new(hello: Vec<u8>) -> Self {
        Self { hello }
    }
}

impl ProtocolParser for RawStream {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn hello(&self) -> Option<Cow<'static, [u8]>> {
        Some(Cow::Owned(self.hello.clone()))
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

/// Pairs a stream with an alternate to probe over a second connection to
/// the same target.
pub struct ChainedStream {
    primary: Arc<dyn ProtocolParser>,
    alternate: Arc<dyn ProtocolParser>,
}

impl ChainedStream {
    pub fn new(primary: Arc<dyn ProtocolParser>, alternate: Arc<dyn ProtocolParser>) -> Self {
        Self { primary, alternate }
    }
}

impl ProtocolParser for ChainedStream {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    fn hello(&self) -> Option<Cow<'static, [u8]>> {
        self.primary.hello()
    }

    fn transmit_hello(&self, scratch: &mut BannerScratch, net: &mut NetApi) -> bool {
        self.primary.transmit_hello(scratch, net)
    }

    fn parse(
        &self,
        scratch: &mut BannerScratch,
        payload: &[u8],
        banner: &mut BannerOutput,
        net: &mut NetApi,
    ) {
        self.primary.parse(scratch, payload, banner, net);
    }

    fn next(&self) -> Option<Arc<dyn ProtocolParser>> {
        Some(self.alternate.clone())
    }

    fn cleanup(&self, scratch: &mut BannerScratch) {
        self.primary.cleanup(scratch);
    }
}

/// Which stream handles which destination port. Populated with the built-in
/// defaults at table creation; mutated only during configuration, before the
/// receive thread starts.
pub struct StreamRegistry {
    http: Arc<HttpStream>,
    tls: Arc<TlsStream>,
    smb: Arc<SmbStream>,
    defaults: DashMap<u16, Arc<dyn ProtocolParser>>,
    overrides: DashMap<u16, Arc<dyn ProtocolParser>>,
    forced: RwLock<Option<Arc<dyn ProtocolParser>>>,
    fallback: Arc<dyn ProtocolParser>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        let http = Arc::new(HttpStream::default());
        let tls = Arc::new(TlsStream::default());
        let smb = Arc::new(SmbStream::default());
        let defaults: DashMap<u16, Arc<dyn ProtocolParser>> = DashMap::new();
        for port in [80, 8080] {
            defaults.insert(port, http.clone());
        }
        for port in [443, 8443] {
            defaults.insert(port, tls.clone());
        }
        defaults.insert(445, smb.clone());
        Self {
            http,
            tls,
            smb,
            defaults,
            overrides: DashMap::new(),
            forced: RwLock::new(None),
            fallback: Arc::new(PassiveStream),
        }
    }

    pub fn http(&self) -> &HttpStream {
        &self.http
    }

    pub fn tls(&self) -> &TlsStream {
        &self.tls
    }

    pub fn smb(&self) -> &SmbStream {
        &self.smb
    }

    pub fn tls_stream(&self) -> Arc<dyn ProtocolParser> {
        self.tls.clone()
    }

    pub fn http_stream(&self) -> Arc<dyn ProtocolParser> {
        self.http.clone()
    }

    pub fn smb_stream(&self) -> Arc<dyn ProtocolParser> {
        self.smb.clone()
    }

    /// Resolves the stream for a destination port. Per-port overrides win
    /// over a forced global hello, which wins over the built-in defaults.
    pub fn stream_for_port(&self, port: u16) -> Arc<dyn ProtocolParser> {
        if let Some(stream) = self.overrides.get(&port) {
            return stream.value().clone();
        }
        if let Some(stream) = self.forced.read().unwrap().as_ref() {
            return stream.clone();
        }
        if let Some(stream) = self.defaults.get(&port) {
            return stream.value().clone();
        }
        self.fallback.clone()
    }

    pub fn set_override(&self, port: u16, stream: Arc<dyn ProtocolParser>) {
        self.overrides.insert(port, stream);
    }

    /// Makes every connection use `stream` for its hello regardless of port.
    pub fn force(&self, stream: Arc<dyn ProtocolParser>) {
        *self.forced.write().unwrap() = Some(stream);
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
