//! The TCP connection table and its event-driven state machine.
//!
//! The table owns every live [`Tcb`] in a slab arena. Bucket chains and the
//! free list are slab indices threaded through the TCBs themselves, so a
//! lookup walks a short chain without touching pointers, and destroying a
//! connection splices it out in constant time. The bucket hash folds the two
//! endpoints together first, so a packet seen from either direction of a
//! connection lands in the same chain.
//!
//! All packet events funnel through [`ConnectionTable::incoming_tcp`]; the
//! ingress loop calls [`ConnectionTable::process_timeouts`] every tick.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::banner::{BannerRecord, BannerReporter};
use crate::config::TableConfig;
use crate::cookie::{symmetric_hash, syn_cookie, Entropy};
use crate::endpoint::Endpoints;
use crate::protocols::{ProtocolParser, StreamRegistry};
use crate::stack::PacketSink;
use crate::tcb::{Segment, Tcb, TcpState};
use crate::timer::TimerWheel;
use crate::timestamp::Timestamp;
use crate::wire::{PacketTemplate, TcpFlags};

mod app;
pub use app::NetApi;
use app::AppEvent;

#[cfg(test)]
mod tests;

/// Wait between transmitting a segment and retrying it
const RETRANSMIT_WAIT: Duration = Duration::from_secs(1);
/// Wait after a retransmission before the next one
const RESEND_WAIT: Duration = Duration::from_secs(2);
/// Patience once everything we sent has been acknowledged
const DRAINED_WAIT: Duration = Duration::from_secs(10);
/// Patience for the peer's half of the close handshake
const CLOSING_WAIT: Duration = Duration::from_secs(5);
/// Fallback rearm for a live connection found without a timer
const CATCHALL_WAIT: Duration = Duration::from_secs(2);

/// Bucket count bounds; requests outside are clamped
const MIN_BUCKETS: usize = 1 << 10;
const MAX_BUCKETS: usize = 1 << 24;

/// A stable reference to a connection in the table's slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcbHandle(pub(crate) u32);

/// Why a connection was destroyed; attached to the teardown log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Timeout,
    Rst,
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            CloseReason::Timeout => "timeout",
            CloseReason::Rst => "rst",
            CloseReason::Shutdown => "shutdown",
        };
        write!(f, "{name}")
    }
}

/// One packet event against an existing connection. Sequence and
/// acknowledgment numbers are the raw header fields; a packet that carries
/// several of these (an ACK with payload and FIN, say) is delivered as the
/// ACK, then the DATA, then the FIN.
#[derive(Debug, Clone, Copy)]
pub enum TcpEvent<'a> {
    SynAck { seqno: u32, ackno: u32 },
    Ack { ackno: u32 },
    Data { seqno: u32, payload: &'a [u8] },
    Fin { seqno: u32 },
    Rst,
    Timeout,
}

pub struct ConnectionTable {
    slab: Vec<Tcb>,
    free: Vec<u32>,
    buckets: Vec<Option<u32>>,
    mask: usize,
    timers: TimerWheel,
    active_count: usize,
    entropy: Entropy,
    template: PacketTemplate,
    sink: Arc<dyn PacketSink>,
    reporter: Arc<dyn BannerReporter>,
    registry: StreamRegistry,
    config: TableConfig,
    pool_empty_warned: bool,
}

impl ConnectionTable {
    pub fn new(
        config: TableConfig,
        template: PacketTemplate,
        sink: Arc<dyn PacketSink>,
        reporter: Arc<dyn BannerReporter>,
    ) -> Self {
        let buckets = allocate_buckets(config.capacity);
        let mask = buckets.len() - 1;
        Self {
            slab: Vec::new(),
            free: Vec::new(),
            buckets,
            mask,
            timers: TimerWheel::new(),
            active_count: 0,
            entropy: config.entropy,
            template,
            sink,
            reporter,
            registry: StreamRegistry::new(),
            config,
            pool_empty_warned: false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut TableConfig {
        &mut self.config
    }

    /// Routes connections to `port` through a custom stream.
    pub fn register_stream(&self, port: u16, stream: Arc<dyn ProtocolParser>) {
        self.registry.set_override(port, stream);
    }

    /// Borrows a connection, if it is still live.
    pub fn tcb(&self, handle: TcbHandle) -> Option<&Tcb> {
        self.slab
            .get(handle.0 as usize)
            .filter(|tcb| tcb.active)
    }

    fn bucket_of(&self, endpoints: &Endpoints) -> usize {
        symmetric_hash(endpoints, self.entropy) as usize & self.mask
    }

    /// Finds the connection with exactly this 4-tuple.
    pub fn lookup(&self, endpoints: &Endpoints) -> Option<TcbHandle> {
        let mut cursor = self.buckets[self.bucket_of(endpoints)];
        while let Some(index) = cursor {
            let tcb = &self.slab[index as usize];
            if tcb.endpoints == *endpoints {
                return Some(TcbHandle(index));
            }
            cursor = tcb.next_in_bucket;
        }
        None
    }

    /// Creates a connection in SYN-SENT, or returns the existing one for
    /// this 4-tuple unchanged.
    pub fn create_tcb(
        &mut self,
        endpoints: Endpoints,
        seqno_me: u32,
        seqno_them: u32,
        ttl: u8,
        stream: Option<Arc<dyn ProtocolParser>>,
        now: Timestamp,
    ) -> TcbHandle {
        if let Some(existing) = self.lookup(&endpoints) {
            return existing;
        }
        let stream =
            stream.unwrap_or_else(|| self.registry.stream_for_port(endpoints.remote.port));
        let tcb = Tcb::new(endpoints, seqno_me, seqno_them, ttl, stream, now);
        let index = match self.free.pop() {
            Some(index) => {
                self.slab[index as usize] = tcb;
                index
            }
            None => {
                self.slab.push(tcb);
                (self.slab.len() - 1) as u32
            }
        };
        let bucket = self.bucket_of(&endpoints);
        self.slab[index as usize].next_in_bucket = self.buckets[bucket];
        self.buckets[bucket] = Some(index);
        self.rearm(index as usize, now + RETRANSMIT_WAIT);
        self.active_count += 1;
        debug!(%endpoints, "connection created");
        TcbHandle(index)
    }

    /// The stateless acceptance path: a SYN-ACK whose acknowledgment number
    /// matches our cookie for the tuple proves we probed this target, so a
    /// connection is minted on the spot. Anything else is ignored.
    pub fn accept_synack(
        &mut self,
        endpoints: Endpoints,
        seqno: u32,
        ackno: u32,
        ttl: u8,
        now: Timestamp,
    ) -> Option<TcbHandle> {
        let cookie = syn_cookie(&endpoints, self.entropy);
        if ackno.wrapping_sub(1) != cookie {
            debug!(%endpoints, "SYN-ACK failed cookie validation");
            return None;
        }
        let handle = self.create_tcb(endpoints, ackno, seqno.wrapping_add(1), ttl, None, now);
        self.incoming_tcp(handle, TcpEvent::SynAck { seqno, ackno }, now);
        Some(handle)
    }

    /// Tears a connection down: splices it out of its bucket, flushes the
    /// banner to the reporter, releases segments and protocol scratch,
    /// unlinks the timer, and parks the slot on the free list.
    pub fn destroy_tcb(&mut self, handle: TcbHandle, reason: CloseReason, now: Timestamp) {
        let index = handle.0;
        let Some(slot) = self.slab.get(index as usize) else {
            warn!("destroy of unknown TCB ignored");
            return;
        };
        let endpoints = slot.endpoints;

        // Splice out of the bucket chain
        let bucket = self.bucket_of(&endpoints);
        let mut found = false;
        if self.buckets[bucket] == Some(index) {
            self.buckets[bucket] = self.slab[index as usize].next_in_bucket;
            found = true;
        } else {
            let mut cursor = self.buckets[bucket];
            while let Some(current) = cursor {
                let next = self.slab[current as usize].next_in_bucket;
                if next == Some(index) {
                    self.slab[current as usize].next_in_bucket =
                        self.slab[index as usize].next_in_bucket;
                    found = true;
                    break;
                }
                cursor = next;
            }
        }
        if !found {
            warn!(%endpoints, "double free of TCB ignored");
            return;
        }

        // Flush the banner before any state is released
        let (fragments, remote, ttl, stream) = {
            let tcb = &mut self.slab[index as usize];
            (
                tcb.banner.take(),
                tcb.endpoints.remote,
                tcb.ttl,
                tcb.stream.clone(),
            )
        };
        for fragment in fragments {
            self.reporter.report(BannerRecord {
                now,
                remote,
                app_protocol: fragment.protocol,
                ttl,
                bytes: fragment.bytes,
            });
        }

        let Self { slab, timers, .. } = self;
        let tcb = &mut slab[index as usize];
        let mut scratch = mem::take(&mut tcb.scratch);
        stream.cleanup(&mut scratch);
        tcb.segments.clear();
        if let Some(key) = tcb.timer.take() {
            timers.cancel(key);
        }
        tcb.endpoints = Endpoints::UNSPECIFIED;
        tcb.active = false;
        tcb.next_in_bucket = None;
        self.free.push(index);
        self.active_count -= 1;
        debug!(%endpoints, %reason, "connection closed");
    }

    /// Destroys every live connection, draining all banners to the
    /// reporter. Called at the end of a scan.
    pub fn flush_all(&mut self, now: Timestamp) {
        for bucket in 0..self.buckets.len() {
            while let Some(index) = self.buckets[bucket] {
                self.destroy_tcb(TcbHandle(index), CloseReason::Shutdown, now);
            }
        }
    }

    /// The single entry point for packet and timer events against a
    /// connection. Returns whether the event was consumed.
    pub fn incoming_tcp(&mut self, handle: TcbHandle, event: TcpEvent, now: Timestamp) -> bool {
        let index = handle.0 as usize;
        if self.tcb(handle).is_none() {
            debug!("event for dead connection dropped");
            return false;
        }

        // Checks that precede any per-state handling
        if matches!(event, TcpEvent::Timeout) {
            let age = now.since(self.slab[index].when_created);
            if age > self.config.connection_timeout {
                debug!(
                    endpoints = %self.slab[index].endpoints,
                    state = %self.slab[index].state,
                    "CONNECTION TIMEOUT"
                );
                self.emit_rst(index);
                self.destroy_tcb(handle, CloseReason::Timeout, now);
                return true;
            }
        }
        if matches!(event, TcpEvent::Rst) {
            self.destroy_tcb(handle, CloseReason::Rst, now);
            return true;
        }

        let state = self.slab[index].state;
        match (state, event) {
            (TcpState::SynSent, TcpEvent::Timeout) => {
                let tcb = &mut self.slab[index];
                tcb.syns_sent += 1;
                let syns = tcb.syns_sent;
                let seqno = tcb.seqno_me.wrapping_sub(1);
                self.emit(index, TcpFlags::SYN, seqno, 0, &[]);
                self.rearm(index, now + Duration::from_secs(syns as u64));
            }
            (TcpState::SynSent, TcpEvent::SynAck { seqno, ackno }) => {
                {
                    let tcb = &mut self.slab[index];
                    // The SYN consumes one sequence number
                    let next = seqno.wrapping_add(1);
                    tcb.seqno_them = next;
                    tcb.seqno_them_first = next;
                    tcb.ackno_me = next;
                    tcb.seqno_me = ackno;
                    tcb.seqno_me_first = ackno;
                    tcb.ackno_them = ackno;
                }
                self.emit_ack(index);
                self.app_dispatch(index, AppEvent::Connected, now);
            }

            (
                TcpState::EstablishedSend | TcpState::EstablishedRecv | TcpState::FinWait1,
                TcpEvent::SynAck { .. },
            ) => {
                // Peer retransmitted its SYN-ACK; our ACK was lost
                self.emit_ack(index);
            }

            (
                TcpState::EstablishedSend | TcpState::EstablishedRecv | TcpState::FinWait1,
                TcpEvent::Ack { ackno },
            ) => {
                self.slab[index].acknowledge(ackno);
                match state {
                    TcpState::EstablishedSend => {
                        if self.slab[index].segments.is_empty() {
                            self.slab[index].state = TcpState::EstablishedRecv;
                            self.rearm(index, now + DRAINED_WAIT);
                            self.app_dispatch(index, AppEvent::SendSent, now);
                        }
                    }
                    TcpState::EstablishedRecv => {
                        self.rearm(index, now + RETRANSMIT_WAIT);
                    }
                    TcpState::FinWait1 => {
                        if self.slab[index].segments.is_empty() {
                            self.slab[index].state = TcpState::FinWait2;
                            self.rearm(index, now + CLOSING_WAIT);
                        } else {
                            self.rearm(index, now + RETRANSMIT_WAIT);
                        }
                    }
                    _ => unreachable!(),
                }
                // Everything ahead of a bare FIN has been accepted; the
                // close is now in flight.
                let tcb = &mut self.slab[index];
                if matches!(
                    tcb.state,
                    TcpState::EstablishedSend | TcpState::EstablishedRecv
                ) && tcb
                    .segments
                    .head()
                    .map(|head| head.is_fin() && head.bytes().is_empty())
                    .unwrap_or(false)
                {
                    tcb.state = TcpState::FinWait1;
                }
            }

            (TcpState::EstablishedRecv, TcpEvent::Fin { seqno }) => {
                self.receive_fin(index, seqno);
                self.slab[index].state = TcpState::CloseWait;
            }
            (TcpState::EstablishedSend | TcpState::FinWait1, TcpEvent::Fin { .. }) => {
                // We still have data in flight; the peer will resend its FIN
                // once it has seen our ACKs.
                debug!("FIN ignored while our data is outstanding");
            }

            (TcpState::EstablishedRecv, TcpEvent::Timeout) => {
                self.app_dispatch(index, AppEvent::RecvTimeout, now);
            }
            (TcpState::EstablishedSend | TcpState::FinWait1, TcpEvent::Timeout) => {
                self.resend(index, now);
            }

            (
                TcpState::EstablishedSend | TcpState::EstablishedRecv | TcpState::FinWait1,
                TcpEvent::Data { seqno, payload },
            ) => {
                self.receive_segment(index, seqno, payload, now);
            }

            (TcpState::FinWait2 | TcpState::TimeWait, TcpEvent::Fin { seqno }) => {
                self.receive_fin(index, seqno);
                self.slab[index].state = TcpState::TimeWait;
                self.rearm(index, now + CLOSING_WAIT);
            }
            (TcpState::TimeWait, TcpEvent::Timeout) => {
                self.destroy_tcb(handle, CloseReason::Timeout, now);
            }

            (TcpState::LastAck | TcpState::Closing, _) => {
                debug!(%state, "event in placeholder state ignored");
            }
            (_, event) => {
                debug!(%state, ?event, "event ignored");
            }
        }
        true
    }

    /// Drains every due timer, feeding each connection a TIMEOUT event.
    /// Called from the ingress loop once per tick.
    pub fn process_timeouts(&mut self, now: Timestamp) {
        while let Some((key, index)) = self.timers.next_expired(now) {
            let slot = index as usize;
            {
                let Some(tcb) = self.slab.get_mut(slot) else {
                    continue;
                };
                if !tcb.active || tcb.timer != Some(key) {
                    debug!("expired timer no longer owned by its connection");
                    continue;
                }
                tcb.timer = None;
            }
            self.incoming_tcp(TcbHandle(index), TcpEvent::Timeout, now);

            // Safety net: every live connection must keep exactly one timer.
            // A transition that forgot to rearm would otherwise orphan the
            // connection until the end of the scan.
            let tcb = &self.slab[slot];
            if tcb.active && tcb.timer.is_none() {
                debug!(endpoints = %tcb.endpoints, "rearming connection with empty timer slot");
                self.rearm(slot, now + CATCHALL_WAIT);
            }
        }
    }

    /// Resets a connection we have no record of. Used by the ingress loop
    /// for packets that match nothing in the table.
    pub fn send_rst(&mut self, endpoints: &Endpoints, seqno: u32, ackno: u32) {
        let Self {
            template,
            sink,
            pool_empty_warned,
            ..
        } = self;
        send_packet(
            template,
            sink.as_ref(),
            pool_empty_warned,
            endpoints,
            seqno,
            ackno,
            TcpFlags::RST | TcpFlags::ACK,
            false,
            &[],
        );
    }

    /// Retransmits the head of the segment queue, byte-identical to its
    /// original transmission.
    fn resend(&mut self, index: usize, now: Timestamp) {
        {
            let Self {
                slab,
                template,
                sink,
                pool_empty_warned,
                ..
            } = self;
            let tcb = &slab[index];
            let Some(head) = tcb.segments.head() else {
                return;
            };
            if head.seqno() != tcb.seqno_me {
                // The queue no longer lines up with the send position;
                // nothing we transmit from here can be right.
                panic!(
                    "segment queue desynchronized: head at {} but next send is {}",
                    head.seqno(),
                    tcb.seqno_me
                );
            }
            send_packet(
                template,
                sink.as_ref(),
                pool_empty_warned,
                &tcb.endpoints,
                head.seqno(),
                tcb.ackno_me,
                head_flags(head),
                tcb.small_window,
                head.bytes(),
            );
        }
        self.rearm(index, now + RESEND_WAIT);
    }

    /// Accepts in-order payload: trims any already-seen prefix, hands the
    /// fresh bytes to the application layer, advances the receive position,
    /// and acknowledges. Anything beyond the next expected byte is dropped;
    /// there is no reassembly buffer.
    fn receive_segment(&mut self, index: usize, seqno: u32, payload: &[u8], now: Timestamp) {
        let expected = self.slab[index].seqno_them;
        let behind = expected.wrapping_sub(seqno);
        if behind > payload.len() as u32 {
            // Either entirely old bytes or a jump past the next expected
            // byte; re-ACK our position either way. A wrapped difference in
            // the lower half of the ring means the segment sits ahead of us.
            let offset = seqno.wrapping_sub(self.slab[index].seqno_them_first);
            if seqno.wrapping_sub(expected) < 1 << 31 {
                debug!(offset, "segment beyond the next expected byte dropped");
            } else {
                debug!(offset, "stale segment dropped");
            }
            self.emit_ack(index);
            return;
        }
        let payload = &payload[behind as usize..];
        if payload.is_empty() {
            self.emit_ack(index);
            return;
        }

        self.app_dispatch(index, AppEvent::RecvPayload(payload), now);

        let tcb = &mut self.slab[index];
        tcb.seqno_them = tcb.seqno_them.wrapping_add(payload.len() as u32);
        tcb.ackno_me = tcb.ackno_me.wrapping_add(payload.len() as u32);
        self.emit_ack(index);
    }

    /// Receives a FIN as a zero-length in-order byte and acknowledges it.
    fn receive_fin(&mut self, index: usize, seqno: u32) {
        {
            let tcb = &mut self.slab[index];
            if seqno == tcb.seqno_them {
                tcb.seqno_them = tcb.seqno_them.wrapping_add(1);
                tcb.ackno_me = tcb.ackno_me.wrapping_add(1);
                debug!(
                    offset = tcb.seqno_them.wrapping_sub(tcb.seqno_them_first),
                    "FIN received"
                );
            } else {
                debug!("out-of-order FIN; acknowledging current position");
            }
        }
        self.emit_ack(index);
    }

    fn emit(&mut self, index: usize, flags: TcpFlags, seqno: u32, ackno: u32, payload: &[u8]) {
        let Self {
            slab,
            template,
            sink,
            pool_empty_warned,
            ..
        } = self;
        let tcb = &slab[index];
        send_packet(
            template,
            sink.as_ref(),
            pool_empty_warned,
            &tcb.endpoints,
            seqno,
            ackno,
            flags,
            tcb.small_window,
            payload,
        );
    }

    fn emit_ack(&mut self, index: usize) {
        let (seqno, ackno) = {
            let tcb = &self.slab[index];
            (tcb.seqno_me, tcb.ackno_me)
        };
        self.emit(index, TcpFlags::ACK, seqno, ackno, &[]);
    }

    fn emit_rst(&mut self, index: usize) {
        let (seqno, ackno) = {
            let tcb = &self.slab[index];
            (tcb.seqno_me, tcb.ackno_me)
        };
        self.emit(index, TcpFlags::RST | TcpFlags::ACK, seqno, ackno, &[]);
    }

    fn rearm(&mut self, index: usize, due: Timestamp) {
        let Self { slab, timers, .. } = self;
        rearm_tcb(timers, &mut slab[index], index as u32, due);
    }
}

/// Replaces a connection's timer entry. Every preserved connection must go
/// through here before control returns to the ingress loop.
fn rearm_tcb(timers: &mut TimerWheel, tcb: &mut Tcb, index: u32, due: Timestamp) {
    if let Some(key) = tcb.timer.take() {
        timers.cancel(key);
    }
    tcb.timer = Some(timers.schedule(due, index));
}

/// Flags for transmitting a queued segment: a bare FIN goes out alone,
/// payload goes out pushed, and a payload-carrying tail FIN closes as it
/// sends.
fn head_flags(head: &Segment) -> TcpFlags {
    if head.bytes().is_empty() && head.is_fin() {
        TcpFlags::FIN | TcpFlags::ACK
    } else if head.is_fin() {
        TcpFlags::PSH | TcpFlags::ACK | TcpFlags::FIN
    } else {
        TcpFlags::PSH | TcpFlags::ACK
    }
}

/// Formats and transmits one packet. An exhausted transmit pool gets one
/// brief yield and retry; a packet dropped after that is logged once per
/// run. This path is not expected to be reachable with a sanely sized pool.
fn send_packet(
    template: &PacketTemplate,
    sink: &dyn PacketSink,
    pool_empty_warned: &mut bool,
    endpoints: &Endpoints,
    seqno: u32,
    ackno: u32,
    flags: TcpFlags,
    small_window: bool,
    payload: &[u8],
) {
    let packet = template.format(endpoints, seqno, ackno, flags, small_window, payload);
    if sink.transmit(packet).is_ok() {
        return;
    }
    std::thread::sleep(Duration::from_micros(100));
    let packet = template.format(endpoints, seqno, ackno, flags, small_window, payload);
    if sink.transmit(packet).is_err() && !*pool_empty_warned {
        warn!("transmit pool exhausted; dropping packets");
        *pool_empty_warned = true;
    }
}

/// Sizes the bucket array: next power of two, clamped, halved on allocation
/// failure rather than giving up.
fn allocate_buckets(requested: usize) -> Vec<Option<u32>> {
    let mut capacity = requested
        .next_power_of_two()
        .clamp(MIN_BUCKETS, MAX_BUCKETS);
    loop {
        let mut buckets: Vec<Option<u32>> = Vec::new();
        if buckets.try_reserve_exact(capacity).is_ok() {
            buckets.resize(capacity, None);
            return buckets;
        }
        if capacity <= MIN_BUCKETS {
            // Last resort; a kilobyte-scale table allocates or the process
            // was doomed anyway.
            buckets.resize(MIN_BUCKETS, None);
            return buckets;
        }
        warn!(capacity, "bucket allocation failed; halving");
        capacity /= 2;
    }
}
