//! The Transmission Control Block: per-connection state.
//!
//! A scanner connection is strictly half-duplex in each phase, so the
//! ESTABLISHED state is split into send and receive halves. The TCB holds
//! the sequence spaces, the queue of unacknowledged outgoing segments, the
//! single timer slot, and the banner material the application layer
//! accumulates.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::banner::{BannerOutput, BannerScratch};
use crate::endpoint::Endpoints;
use crate::payload::Payload;
use crate::protocols::ProtocolParser;
use crate::timer::TimerKey;
use crate::timestamp::Timestamp;

/// Payload bytes per segment until the peer advertises otherwise.
pub const DEFAULT_MSS: u16 = 1400;

/// How far an acknowledgment may sit from the head of the send queue before
/// it is treated as stale or out of range. A scanner connection never has
/// anywhere near this much data in flight, so the window stands in for
/// RFC-style window accounting.
const ACK_WINDOW: u32 = 100_000;

/// Connection states. CLOSED and LISTEN do not exist here: a TCB is created
/// only once a target has answered, and is destroyed outright instead of
/// lingering in CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    /// Our SYN is out (or is treated as out, for stateless probes) and
    /// unanswered.
    SynSent,
    /// Data of ours is in flight and unacknowledged.
    EstablishedSend,
    /// Nothing of ours is outstanding; we are waiting on the peer.
    EstablishedRecv,
    /// The peer closed its half while we were receiving.
    CloseWait,
    /// Waiting for the final acknowledgment of our close.
    LastAck,
    /// Our FIN is in flight.
    FinWait1,
    /// Our FIN is acknowledged; waiting for the peer's.
    FinWait2,
    /// Both sides closed simultaneously.
    Closing,
    /// Draining the close handshake before the slot is reused.
    TimeWait,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TcpState::SynSent => "SYN-SENT",
            TcpState::EstablishedSend => "ESTABLISHED-SEND",
            TcpState::EstablishedRecv => "ESTABLISHED-RECV",
            TcpState::CloseWait => "CLOSE-WAIT",
            TcpState::LastAck => "LAST-ACK",
            TcpState::FinWait1 => "FIN-WAIT-1",
            TcpState::FinWait2 => "FIN-WAIT-2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME-WAIT",
        };
        write!(f, "{name}")
    }
}

/// The application dispatch sub-state layered over the TCP state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    /// Handshake still in progress
    #[default]
    Connect,
    /// Connected; waiting to either hear from the server or time out and
    /// send our hello
    ReceiveHello,
    /// Banner collection in progress
    ReceiveNext,
    /// Parser-written follow-up data is in flight
    SendNext,
}

/// One outgoing segment awaiting acknowledgment.
#[derive(Debug)]
pub struct Segment {
    seqno: u32,
    payload: Payload,
    fin: bool,
}

impl Segment {
    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    pub fn bytes(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Sequence space consumed: payload bytes plus one for a FIN.
    pub fn seg_len(&self) -> u32 {
        self.payload.len() as u32 + self.fin as u32
    }
}

#[derive(Debug, Default)]
pub struct SegmentQueue {
    segments: VecDeque<Segment>,
}

/// What [`SegmentQueue::append`] did with the caller's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub(crate) enum AppendOutcome {
    /// Queued; if `transmit_head` the queue was idle and the new head
    /// should go out immediately.
    Queued { transmit_head: bool },
    /// The queue already ends in a FIN; the bytes were discarded.
    AfterFin,
    /// Zero bytes and no FIN; nothing to do.
    Nothing,
}

impl SegmentQueue {
    pub fn head(&self) -> Option<&Segment> {
        self.segments.front()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn clear(&mut self) {
        self.segments.clear();
    }

    /// Appends `payload` after everything already queued, splitting it into
    /// MSS-sized segments. Only a queue that was idle wants its new head
    /// transmitted eagerly; everything else waits for acknowledgments to
    /// pull it forward.
    pub(crate) fn append(
        &mut self,
        seqno_me: u32,
        mss: u16,
        mut payload: Payload,
        fin: bool,
    ) -> AppendOutcome {
        if payload.is_empty() && !fin {
            return AppendOutcome::Nothing;
        }
        if matches!(self.segments.back(), Some(tail) if tail.fin) {
            debug!("send after FIN discarded");
            return AppendOutcome::AfterFin;
        }

        // Sequence number following everything already queued
        let mut seqno = seqno_me;
        for segment in &self.segments {
            seqno = seqno.wrapping_add(segment.seg_len());
        }

        let was_empty = self.segments.is_empty();
        let mss = mss as usize;
        while payload.len() > mss {
            let head = payload.split_front(mss);
            let advance = head.len() as u32;
            self.segments.push_back(Segment {
                seqno,
                payload: head,
                fin: false,
            });
            seqno = seqno.wrapping_add(advance);
        }
        self.segments.push_back(Segment {
            seqno,
            payload,
            fin,
        });
        AppendOutcome::Queued {
            transmit_head: was_empty,
        }
    }

    #[cfg(test)]
    fn fin_count(&self) -> usize {
        self.segments.iter().filter(|segment| segment.fin).count()
    }
}

/// The state record for one connection.
pub struct Tcb {
    pub(crate) endpoints: Endpoints,
    pub(crate) state: TcpState,
    pub(crate) app: AppState,
    /// Sequence number of the next byte we will transmit; equals the head
    /// of the segment queue whenever the queue is non-empty
    pub(crate) seqno_me: u32,
    /// Next byte we expect from the peer
    pub(crate) seqno_them: u32,
    /// What our outgoing ACKs acknowledge; tracks `seqno_them`
    pub(crate) ackno_me: u32,
    /// Highest byte of ours the peer has acknowledged
    pub(crate) ackno_them: u32,
    /// Baselines for readable offsets in logs
    pub(crate) seqno_me_first: u32,
    pub(crate) seqno_them_first: u32,
    pub(crate) segments: SegmentQueue,
    /// The connection's one slot in the timer wheel
    pub(crate) timer: Option<TimerKey>,
    pub(crate) active: bool,
    pub(crate) small_window: bool,
    pub(crate) syns_sent: u32,
    pub(crate) mss: u16,
    /// TTL observed on the packet that opened the connection, reported
    /// alongside the banner
    pub(crate) ttl: u8,
    pub(crate) stream: Arc<dyn ProtocolParser>,
    pub(crate) banner: BannerOutput,
    pub(crate) scratch: BannerScratch,
    pub(crate) when_created: Timestamp,
    /// Intrusive link in the table's bucket chain
    pub(crate) next_in_bucket: Option<u32>,
}

impl Tcb {
    pub(crate) fn new(
        endpoints: Endpoints,
        seqno_me: u32,
        seqno_them: u32,
        ttl: u8,
        stream: Arc<dyn ProtocolParser>,
        when_created: Timestamp,
    ) -> Self {
        Self {
            endpoints,
            state: TcpState::SynSent,
            app: AppState::Connect,
            seqno_me,
            seqno_them,
            ackno_me: seqno_them,
            ackno_them: seqno_me,
            seqno_me_first: seqno_me,
            seqno_them_first: seqno_them,
            segments: SegmentQueue::default(),
            timer: None,
            active: true,
            small_window: false,
            syns_sent: 0,
            mss: DEFAULT_MSS,
            ttl,
            stream,
            banner: BannerOutput::default(),
            scratch: BannerScratch::default(),
            when_created,
            next_in_bucket: None,
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn app_state(&self) -> AppState {
        self.app
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn banner(&self) -> &BannerOutput {
        &self.banner
    }

    pub fn segments(&self) -> &SegmentQueue {
        &self.segments
    }

    pub fn seqno_me(&self) -> u32 {
        self.seqno_me
    }

    pub fn seqno_them(&self) -> u32 {
        self.seqno_them
    }

    /// Applies a cumulative acknowledgment: retires fully covered segments,
    /// trims a partially covered head in place, and advances `seqno_me`.
    /// Returns whether any state changed.
    pub(crate) fn acknowledge(&mut self, ackno: u32) -> bool {
        if ackno == self.seqno_me {
            // Repeat of where we already are
            return false;
        }

        let advance = ackno.wrapping_sub(self.seqno_me);
        if advance > ACK_WINDOW {
            debug!(
                offset = self.seqno_me.wrapping_sub(ackno),
                "stale ACK from the past dropped"
            );
            return false;
        }
        // This arm cannot fire: an ackno that survived the check above is at
        // most ACK_WINDOW ahead of seqno_me, which puts the difference here
        // within ACK_WINDOW of u32::MAX.
        if self.seqno_me.wrapping_sub(ackno) < ACK_WINDOW {
            debug!("out-of-range ACK from the future dropped");
            return false;
        }

        let mut remaining = advance;
        while remaining > 0 {
            let Some(head) = self.segments.segments.front_mut() else {
                debug!(
                    acked = ackno.wrapping_sub(self.seqno_me_first),
                    "ACK advances past everything queued"
                );
                break;
            };
            let seg_len = head.seg_len();
            if remaining >= seg_len {
                remaining -= seg_len;
                self.seqno_me = self.seqno_me.wrapping_add(seg_len);
                // Dropping the segment frees any owned buffer
                self.segments.segments.pop_front();
            } else {
                // Mid-segment acknowledgment: shrink the head in place
                head.payload.trim_front(remaining as usize);
                head.seqno = head.seqno.wrapping_add(remaining);
                self.seqno_me = self.seqno_me.wrapping_add(remaining);
                remaining = 0;
            }
        }
        self.ackno_them = ackno;
        true
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("endpoints", &self.endpoints)
            .field("state", &self.state)
            .field("app", &self.app)
            .field("seqno_me", &self.seqno_me)
            .field("seqno_them", &self.seqno_them)
            .field("segments", &self.segments.len())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
