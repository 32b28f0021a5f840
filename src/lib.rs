//! A userspace TCP connection engine for stateless banner scanning.
//!
//! This crate is the piece of a scanner that sits between the packet
//! capture layer and the protocol parsers: it turns raw half-duplex TCP
//! segment arrivals into short-lived sessions that probe a service, send a
//! hello, collect the banner, and tear down. It deliberately bypasses the
//! host TCP stack; probes are stateless SYNs whose sequence numbers are
//! keyed cookies, and a connection record exists only once a target has
//! answered.
//!
//! The centerpiece is [`table::ConnectionTable`]: a bounded, symmetric-hash
//! bucketed arena of connection records, each running a compressed TCP
//! state machine tailored to single-request scanning. The ingress loop
//! feeds it packet events through [`table::ConnectionTable::incoming_tcp`]
//! and drives time through [`table::ConnectionTable::process_timeouts`];
//! completed banners flow out through the [`banner::BannerReporter`] it was
//! built with, and outgoing packets through a [`stack::PacketSink`].

pub mod banner;
pub mod config;
pub mod cookie;
pub mod endpoint;
pub mod payload;
pub mod protocols;
pub mod stack;
pub mod table;
pub mod tcb;
pub mod timer;
pub mod timestamp;
pub mod wire;

pub use banner::{BannerOutput, BannerRecord, BannerReporter, MemoryReporter};
pub use config::{AddrRange, ConfigError, TableConfig};
pub use cookie::{symmetric_hash, syn_cookie, Entropy};
pub use endpoint::{Endpoint, Endpoints};
pub use payload::{Discipline, Payload};
pub use protocols::ProtocolParser;
pub use stack::{channel, ChannelSink, PacketSink, SinkFull, SinkReceiver};
pub use table::{CloseReason, ConnectionTable, NetApi, TcbHandle, TcpEvent};
pub use tcb::{AppState, Tcb, TcpState};
pub use timestamp::Timestamp;
pub use wire::{PacketTemplate, TcpFlags, WireError};
