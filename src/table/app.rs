//! The application dispatch sub-machine.
//!
//! Layered over the TCP state machine, this decides when the hello goes
//! out, feeds received payload to the protocol stream, and hands the stream
//! a [`NetApi`] through which it can write follow-up data. It also launches
//! the alternate-protocol reconnect: a second connection to the same target
//! from the next local 4-tuple.

use std::borrow::Cow;
use std::mem;
use std::sync::Arc;

use tracing::debug;

use super::{head_flags, rearm_tcb, send_packet, ConnectionTable, RETRANSMIT_WAIT};
use crate::cookie::syn_cookie;
use crate::endpoint::{Endpoint, Endpoints};
use crate::payload::Payload;
use crate::protocols::ProtocolParser;
use crate::stack::PacketSink;
use crate::tcb::{AppendOutcome, AppState, Tcb, TcpState};
use crate::timer::TimerWheel;
use crate::timestamp::Timestamp;
use crate::wire::{PacketTemplate, TcpFlags};

/// Inputs to the application sub-machine.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AppEvent<'a> {
    /// The three-way handshake completed
    Connected,
    /// The receive timer fired with nothing from the server
    RecvTimeout,
    /// Fresh in-order payload arrived
    RecvPayload(&'a [u8]),
    /// Everything we queued has been acknowledged
    SendSent,
}

/// The handle protocol streams use to write application data back into
/// their connection.
pub struct NetApi<'a> {
    pub(crate) tcb: &'a mut Tcb,
    pub(crate) index: u32,
    pub(crate) template: &'a PacketTemplate,
    pub(crate) sink: &'a dyn PacketSink,
    pub(crate) timers: &'a mut TimerWheel,
    pub(crate) pool_empty_warned: &'a mut bool,
    pub(crate) now: Timestamp,
}

impl NetApi<'_> {
    /// Queues application bytes on the connection. If the queue was idle the
    /// new head is transmitted immediately; everything else rides behind the
    /// acknowledgment clock. `fin` closes our half after the bytes.
    pub fn send(&mut self, payload: Payload, fin: bool) {
        let outcome = self
            .tcb
            .segments
            .append(self.tcb.seqno_me, self.tcb.mss, payload, fin);
        match outcome {
            AppendOutcome::Nothing => return,
            AppendOutcome::AfterFin => {
                // The queued FIN already ends the conversation; just keep
                // the retransmit clock running.
            }
            AppendOutcome::Queued { transmit_head } => {
                if transmit_head {
                    let head = self.tcb.segments.head().expect("just appended");
                    send_packet(
                        self.template,
                        self.sink,
                        self.pool_empty_warned,
                        &self.tcb.endpoints,
                        head.seqno(),
                        self.tcb.ackno_me,
                        head_flags(head),
                        self.tcb.small_window,
                        head.bytes(),
                    );
                    self.tcb.state = TcpState::EstablishedSend;
                }
                if self.tcb.app == AppState::ReceiveNext {
                    self.tcb.app = AppState::SendNext;
                }
            }
        }
        rearm_tcb(self.timers, self.tcb, self.index, self.now + RETRANSMIT_WAIT);
    }

    /// Shrinks the window this connection advertises from here on.
    pub fn set_small_window(&mut self, on: bool) {
        self.tcb.small_window = on;
    }

    pub fn remote(&self) -> Endpoint {
        self.tcb.endpoints.remote
    }
}

impl ConnectionTable {
    fn net_api(&mut self, index: usize, now: Timestamp) -> NetApi<'_> {
        let sink: &dyn PacketSink = self.sink.as_ref();
        let Self {
            slab,
            template,
            timers,
            pool_empty_warned,
            ..
        } = self;
        NetApi {
            tcb: &mut slab[index],
            index: index as u32,
            template,
            sink,
            timers,
            pool_empty_warned,
            now,
        }
    }

    pub(crate) fn app_dispatch(&mut self, index: usize, event: AppEvent, now: Timestamp) {
        let app = self.slab[index].app;
        match (app, event) {
            (AppState::Connect, AppEvent::Connected) => {
                {
                    let tcb = &mut self.slab[index];
                    tcb.state = TcpState::EstablishedRecv;
                    tcb.app = AppState::ReceiveHello;
                }
                let due = now + self.config.hello_timeout;
                self.rearm(index, due);
                if let Some(alternate) = self.slab[index].stream.next() {
                    self.launch_alternate(index, alternate, now);
                }
            }
            (AppState::ReceiveHello, AppEvent::RecvTimeout) => {
                self.send_hello(index, now);
            }
            (AppState::ReceiveHello, AppEvent::RecvPayload(payload)) => {
                // The server spoke first; skip our hello and collect.
                self.slab[index].app = AppState::ReceiveNext;
                self.deliver(index, payload, now);
            }
            (AppState::ReceiveNext, AppEvent::RecvPayload(payload)) => {
                self.deliver(index, payload, now);
            }
            (AppState::SendNext, AppEvent::SendSent) => {
                let tcb = &mut self.slab[index];
                tcb.state = TcpState::EstablishedRecv;
                tcb.app = AppState::ReceiveNext;
            }
            (app, event) => {
                debug!(?app, ?event, "application event ignored");
            }
        }
    }

    /// The hello-timer path: either the stream transmits its own hello, or
    /// the canned hello goes out as one segment that also closes our half.
    fn send_hello(&mut self, index: usize, now: Timestamp) {
        let stream = self.slab[index].stream.clone();
        let mut scratch = mem::take(&mut self.slab[index].scratch);
        let sent = {
            let mut net = self.net_api(index, now);
            stream.transmit_hello(&mut scratch, &mut net)
        };
        if !sent {
            if let Some(hello) = stream.hello() {
                let payload = match hello {
                    Cow::Borrowed(bytes) => Payload::borrowed(bytes),
                    Cow::Owned(bytes) => Payload::adopted(bytes.into_boxed_slice()),
                };
                let mut net = self.net_api(index, now);
                net.send(payload, true);
            } else {
                debug!(
                    stream = stream.name(),
                    "no hello for this stream; waiting on the server"
                );
            }
        }
        self.slab[index].scratch = scratch;
    }

    /// Runs the protocol parser over fresh payload. Banner and scratch are
    /// moved out for the duration so the parser can also hold the
    /// connection through the [`NetApi`].
    fn deliver(&mut self, index: usize, payload: &[u8], now: Timestamp) {
        let stream = self.slab[index].stream.clone();
        let mut scratch = mem::take(&mut self.slab[index].scratch);
        let mut banner = mem::take(&mut self.slab[index].banner);
        {
            let mut net = self.net_api(index, now);
            stream.parse(&mut scratch, payload, &mut banner, &mut net);
        }
        let tcb = &mut self.slab[index];
        tcb.scratch = scratch;
        tcb.banner = banner;
    }

    /// Opens a second connection to the same target from the next local
    /// 4-tuple, running the alternate protocol stream.
    fn launch_alternate(
        &mut self,
        index: usize,
        alternate: Arc<dyn ProtocolParser>,
        now: Timestamp,
    ) {
        let origin = self.slab[index].endpoints;
        let ttl = self.slab[index].ttl;
        let local = self.config.next_source(origin.local);
        let endpoints = Endpoints::new(local, origin.remote);
        if self.lookup(&endpoints).is_some() {
            debug!(%endpoints, "alternate connection already exists");
            return;
        }
        let cookie = syn_cookie(&endpoints, self.entropy);
        let handle = self.create_tcb(
            endpoints,
            cookie.wrapping_add(1),
            0,
            ttl,
            Some(alternate),
            now,
        );
        debug!(%endpoints, "launching alternate-protocol connection");
        self.emit(handle.0 as usize, TcpFlags::SYN, cookie, 0, &[]);
    }
}
