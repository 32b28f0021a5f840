//! Banner accumulation and reporting.
//!
//! Protocol parsers append evidence fragments to a per-connection
//! [`BannerOutput`] as payload arrives. Nothing is reported until the
//! connection is destroyed, at which point the accumulated fragments are
//! flushed through the [`BannerReporter`] the table was built with.

use std::sync::Mutex;

use crate::endpoint::Endpoint;
use crate::timestamp::Timestamp;

/// One piece of application-protocol evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BannerFragment {
    pub protocol: &'static str,
    pub bytes: Vec<u8>,
}

/// Per-connection accumulator. Fragments for the same protocol are merged
/// in arrival order.
#[derive(Debug, Default)]
pub struct BannerOutput {
    fragments: Vec<BannerFragment>,
}

impl BannerOutput {
    pub fn append(&mut self, protocol: &'static str, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(fragment) = self
            .fragments
            .iter_mut()
            .find(|fragment| fragment.protocol == protocol)
        {
            fragment.bytes.extend_from_slice(bytes);
        } else {
            self.fragments.push(BannerFragment {
                protocol,
                bytes: bytes.to_vec(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn fragments(&self) -> &[BannerFragment] {
        &self.fragments
    }

    pub(crate) fn take(&mut self) -> Vec<BannerFragment> {
        std::mem::take(&mut self.fragments)
    }
}

/// Parser scratch space that lives alongside the banner on the connection.
/// Protocols that reassemble records across segments keep their partial
/// state here; it is torn down by the stream's cleanup hook.
#[derive(Debug, Default)]
pub struct BannerScratch {
    /// Whether this connection's hello has gone out already
    pub sent_hello: bool,
    /// Partial-record assembly buffer
    pub buffer: Vec<u8>,
}

/// One flushed banner, as delivered to the reporter.
#[derive(Debug, Clone)]
pub struct BannerRecord {
    pub now: Timestamp,
    pub remote: Endpoint,
    pub app_protocol: &'static str,
    pub ttl: u8,
    pub bytes: Vec<u8>,
}

/// The output sink banners are flushed into. Must be callable from the
/// receive thread; implementations own their own synchronization.
pub trait BannerReporter: Send + Sync {
    fn report(&self, record: BannerRecord);
}

/// Keeps every reported banner in memory. Useful for tests and for
/// embedders that post-process results in bulk.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    records: Mutex<Vec<BannerRecord>>,
}

impl MemoryReporter {
    pub fn take(&self) -> Vec<BannerRecord> {
        std::mem::take(&mut self.records.lock().unwrap())
    }
}

impl BannerReporter for MemoryReporter {
    fn report(&self, record: BannerRecord) {
        self.records.lock().unwrap().push(record);
    }
}
