use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::*;
use crate::banner::{BannerOutput, BannerScratch, MemoryReporter};
use crate::cookie::syn_cookie;
use crate::endpoint::Endpoint;
use crate::stack::VecSink;
use crate::tcb::AppState;

const ENTROPY: Entropy = Entropy::from_seed(0x5eed);

struct Harness {
    table: ConnectionTable,
    sink: Arc<VecSink>,
    reporter: Arc<MemoryReporter>,
}

fn harness() -> Harness {
    let sink = Arc::new(VecSink::default());
    let reporter = Arc::new(MemoryReporter::default());
    let config = TableConfig {
        capacity: 1 << 10,
        entropy: ENTROPY,
        ..Default::default()
    };
    let table = ConnectionTable::new(
        config,
        PacketTemplate::default(),
        sink.clone(),
        reporter.clone(),
    );
    Harness {
        table,
        sink,
        reporter,
    }
}

fn endpoints_for_port(port: u16) -> Endpoints {
    Endpoints::new(
        Endpoint::new("10.0.0.1".parse().unwrap(), 12345),
        Endpoint::new("1.2.3.4".parse().unwrap(), port),
    )
}

fn at(seconds_tenths: u64) -> Timestamp {
    Timestamp::from_micros(seconds_tenths * 100_000)
}

/// Runs the opening exchange against port `port`:
///
///     SYN-SENT    <-- <SEQ=1000><ACK=7777><CTL=SYN,ACK>  <-- server
///     ESTAB-RECV  --> <SEQ=7777><ACK=1001><CTL=ACK>      -->
///
/// and drains the handshake ACK from the sink.
fn established(harness: &mut Harness, port: u16) -> TcbHandle {
    let endpoints = endpoints_for_port(port);
    let handle = harness
        .table
        .create_tcb(endpoints, 7777, 1001, 54, None, Timestamp::ZERO);
    harness.table.incoming_tcp(
        handle,
        TcpEvent::SynAck {
            seqno: 1000,
            ackno: 7777,
        },
        Timestamp::ZERO,
    );

    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    assert!(packets[0].flags.ack() && !packets[0].flags.syn());
    assert_eq!(packets[0].seqno, 7777);
    assert_eq!(packets[0].ackno, 1001);

    let tcb = harness.table.tcb(handle).unwrap();
    assert_eq!(tcb.state(), TcpState::EstablishedRecv);
    assert_eq!(tcb.app_state(), AppState::ReceiveHello);
    handle
}

#[test]
fn http_banner_happy_path() {
    // The whole life of an HTTP banner grab:
    //
    // 1.  SYN-SENT    <-- <SEQ=1000><ACK=7777><CTL=SYN,ACK>      <-- server
    //     ESTAB-RECV  --> <SEQ=7777><ACK=1001><CTL=ACK>          -->
    // 2.  (2 s of silence; the hello timer fires)
    //     ESTAB-SEND  --> <SEQ=7777><ACK=1001><CTL=PSH,ACK,FIN>  --> + hello
    // 3.  ESTAB-RECV  <-- <ACK=7777+len+1><CTL=ACK>              <--
    // 4.              <-- <SEQ=1001><CTL=ACK> + "HTTP/1.1 ..."   <--
    //                 --> <ACK=1001+plen><CTL=ACK>               -->
    // 5.  CLOSE-WAIT  <-- <SEQ=1001+plen><CTL=FIN,ACK>           <--
    //                 --> <ACK=1001+plen+1><CTL=ACK>             -->
    // 6.  (connection timeout)
    //                 --> <CTL=RST,ACK>                          -->
    //     banner flushed to the reporter
    let mut harness = harness();
    let handle = established(&mut harness, 80);

    // 2
    harness.table.process_timeouts(at(20));
    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    let hello = &packets[0];
    assert!(hello.flags.psh() && hello.flags.ack() && hello.flags.fin());
    assert_eq!(hello.seqno, 7777);
    assert_eq!(hello.ackno, 1001);
    assert!(hello.payload.starts_with(b"GET / HTTP/1.0\r\n"));
    let hello_len = hello.payload.len() as u32;
    assert_eq!(
        harness.table.tcb(handle).unwrap().state(),
        TcpState::EstablishedSend
    );

    // 3
    harness.table.incoming_tcp(
        handle,
        TcpEvent::Ack {
            ackno: 7777 + hello_len + 1,
        },
        at(21),
    );
    assert_eq!(
        harness.table.tcb(handle).unwrap().state(),
        TcpState::EstablishedRecv
    );
    assert!(harness.table.tcb(handle).unwrap().segments().is_empty());

    // 4
    let response = b"HTTP/1.1 200 OK\r\n\r\nhi";
    harness.table.incoming_tcp(
        handle,
        TcpEvent::Ack {
            ackno: 7777 + hello_len + 1,
        },
        at(22),
    );
    harness.table.incoming_tcp(
        handle,
        TcpEvent::Data {
            seqno: 1001,
            payload: response,
        },
        at(22),
    );
    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    assert!(packets[0].flags.ack());
    assert_eq!(packets[0].ackno, 1001 + response.len() as u32);
    let tcb = harness.table.tcb(handle).unwrap();
    assert_eq!(tcb.app_state(), AppState::ReceiveNext);
    assert_eq!(tcb.banner().fragments().len(), 1);
    assert_eq!(tcb.banner().fragments()[0].protocol, "http");
    assert_eq!(tcb.banner().fragments()[0].bytes, response);

    // 5
    harness.table.incoming_tcp(
        handle,
        TcpEvent::Fin {
            seqno: 1001 + response.len() as u32,
        },
        at(23),
    );
    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].ackno, 1001 + response.len() as u32 + 1);
    assert_eq!(
        harness.table.tcb(handle).unwrap().state(),
        TcpState::CloseWait
    );

    // 6
    harness.table.process_timeouts(at(315));
    assert!(harness.table.tcb(handle).is_none());
    assert_eq!(harness.table.active_count(), 0);
    let packets = harness.sink.take_parsed();
    assert!(packets.iter().any(|packet| packet.flags.rst()));

    let records = harness.reporter.take();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].app_protocol, "http");
    assert_eq!(records[0].bytes, response);
    assert_eq!(records[0].remote, endpoints_for_port(80).remote);
    assert_eq!(records[0].ttl, 54);
}

#[test]
fn out_of_order_data_is_dropped() {
    // Payload past the next expected byte is not buffered: the engine
    // re-ACKs its position and moves on.
    let mut harness = harness();
    let handle = established(&mut harness, 80);

    harness.table.incoming_tcp(
        handle,
        TcpEvent::Data {
            seqno: 1011,
            payload: b"hello",
        },
        at(1),
    );
    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    assert!(packets[0].flags.ack());
    assert_eq!(packets[0].ackno, 1001);

    let tcb = harness.table.tcb(handle).unwrap();
    assert_eq!(tcb.seqno_them(), 1001);
    assert!(tcb.banner().is_empty());
}

#[test]
fn overlapping_data_is_trimmed() {
    // A retransmission that overlaps what we already accepted only
    // delivers its fresh suffix.
    let mut harness = harness();
    let handle = established(&mut harness, 80);

    harness.table.incoming_tcp(
        handle,
        TcpEvent::Data {
            seqno: 1001,
            payload: b"abcde",
        },
        at(1),
    );
    harness.sink.take();
    assert_eq!(harness.table.tcb(handle).unwrap().seqno_them(), 1006);

    // seqno 1003 covers 1003..1011, of which 1003..1006 were already
    // accepted; only the last five bytes are new.
    harness.table.incoming_tcp(
        handle,
        TcpEvent::Data {
            seqno: 1003,
            payload: b"cdefghij",
        },
        at(2),
    );
    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].ackno, 1011);

    let tcb = harness.table.tcb(handle).unwrap();
    assert_eq!(tcb.seqno_them(), 1011);
    assert_eq!(tcb.banner().fragments()[0].bytes, b"abcdefghij");
}

#[test]
fn fully_duplicate_data_only_reacks() {
    let mut harness = harness();
    let handle = established(&mut harness, 80);

    harness.table.incoming_tcp(
        handle,
        TcpEvent::Data {
            seqno: 1001,
            payload: b"abcde",
        },
        at(1),
    );
    harness.sink.take();

    harness.table.incoming_tcp(
        handle,
        TcpEvent::Data {
            seqno: 1001,
            payload: b"abcde",
        },
        at(2),
    );
    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].ackno, 1006);
    assert_eq!(
        harness.table.tcb(handle).unwrap().banner().fragments()[0].bytes,
        b"abcde"
    );
}

/// A stream with a hello bigger than one segment, for exercising
/// segmentation and retransmission.
struct BigHelloStream {
    hello: Vec<u8>,
}

impl crate::protocols::ProtocolParser for BigHelloStream {
    fn name(&self) -> &'static str {
        "big"
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

#[test]
fn oversized_hello_is_segmented_and_retransmitted_identically() {
    // A 1500-byte hello against MSS 1400 splits [1400, 100]; only the head
    // goes out. With no acknowledgment, the retransmission must be
    // byte-identical to the original.
    let mut harness = harness();
    let hello: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
    harness
        .table
        .register_stream(9999, Arc::new(BigHelloStream { hello: hello.clone() }));
    let handle = established(&mut harness, 9999);

    harness.table.process_timeouts(at(20));
    let mut first = harness.sink.take();
    assert_eq!(first.len(), 1);
    let first = first.remove(0);
    let parsed = crate::wire::parse(&first).unwrap();
    assert_eq!(parsed.payload.len(), 1400);
    assert_eq!(parsed.payload, hello[..1400]);
    assert!(parsed.flags.psh() && !parsed.flags.fin());
    assert_eq!(harness.table.tcb(handle).unwrap().segments().len(), 2);

    // Two seconds of silence later, the exact same bytes go out again.
    harness.table.process_timeouts(at(40));
    let mut second = harness.sink.take();
    assert_eq!(second.len(), 1);
    assert_eq!(second.remove(0), first);
}

#[test]
fn stale_ack_leaves_the_connection_unchanged() {
    let mut harness = harness();
    let handle = established(&mut harness, 80);
    harness.table.process_timeouts(at(20));
    harness.sink.take();
    let before_len = harness.table.tcb(handle).unwrap().segments().len();
    let before_seqno = harness.table.tcb(handle).unwrap().seqno_me();

    harness.table.incoming_tcp(
        handle,
        TcpEvent::Ack {
            ackno: before_seqno.wrapping_sub(200_000),
        },
        at(21),
    );
    let tcb = harness.table.tcb(handle).unwrap();
    assert_eq!(tcb.segments().len(), before_len);
    assert_eq!(tcb.seqno_me(), before_seqno);
    assert_eq!(tcb.state(), TcpState::EstablishedSend);
}

#[test]
fn connection_timeout_resets_and_destroys() {
    // A connection that never gets anywhere is reset and torn down once it
    // exceeds the connection timeout; an empty banner set means no records.
    let mut harness = harness();
    let endpoints = endpoints_for_port(80);
    let handle = harness
        .table
        .create_tcb(endpoints, 7777, 1001, 54, None, Timestamp::ZERO);
    assert_eq!(harness.table.active_count(), 1);

    harness.table.process_timeouts(at(310));
    assert!(harness.table.tcb(handle).is_none());
    assert_eq!(harness.table.active_count(), 0);

    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    assert!(packets[0].flags.rst());
    assert!(harness.reporter.take().is_empty());
}

#[test]
fn graceful_close_through_fin_wait() {
    //     ESTAB-SEND  --> <SEQ=7777><CTL=PSH,ACK,FIN> + hello  -->
    //     FIN-WAIT-1  <-- <ACK=7777+len><CTL=ACK>              <-- (data only)
    //     FIN-WAIT-2  <-- <ACK=7777+len+1><CTL=ACK>            <-- (our FIN)
    //     TIME-WAIT   <-- <SEQ=1001><CTL=FIN,ACK>              <--
    //                 --> <ACK=1002><CTL=ACK>                  -->
    //     (time-wait timer) connection destroyed
    let mut harness = harness();
    let handle = established(&mut harness, 80);
    harness.table.process_timeouts(at(20));
    let hello_len = harness.sink.take_parsed()[0].payload.len() as u32;

    // The server acknowledges the payload but not the FIN, leaving a bare
    // FIN at the head of the queue.
    harness.table.incoming_tcp(
        handle,
        TcpEvent::Ack {
            ackno: 7777 + hello_len,
        },
        at(21),
    );
    assert_eq!(
        harness.table.tcb(handle).unwrap().state(),
        TcpState::FinWait1
    );

    harness.table.incoming_tcp(
        handle,
        TcpEvent::Ack {
            ackno: 7777 + hello_len + 1,
        },
        at(22),
    );
    assert_eq!(
        harness.table.tcb(handle).unwrap().state(),
        TcpState::FinWait2
    );

    harness.table.incoming_tcp(handle, TcpEvent::Fin { seqno: 1001 }, at(23));
    let packets = harness.sink.take_parsed();
    assert_eq!(packets.last().unwrap().ackno, 1002);
    assert_eq!(
        harness.table.tcb(handle).unwrap().state(),
        TcpState::TimeWait
    );

    harness.table.process_timeouts(at(80));
    assert!(harness.table.tcb(handle).is_none());
    assert_eq!(harness.table.active_count(), 0);
}

#[test]
fn rst_destroys_immediately() {
    let mut harness = harness();
    let handle = established(&mut harness, 80);
    harness.table.incoming_tcp(
        handle,
        TcpEvent::Data {
            seqno: 1001,
            payload: b"partial banner",
        },
        at(1),
    );
    harness.sink.take();

    harness.table.incoming_tcp(handle, TcpEvent::Rst, at(2));
    assert!(harness.table.tcb(handle).is_none());
    // Whatever was collected before the reset still gets reported.
    let records = harness.reporter.take();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].bytes, b"partial banner");
}

#[test]
fn table_integrity_across_create_and_destroy() {
    let mut harness = harness();
    let mut handles = Vec::new();
    for port in 1000..1050u16 {
        handles.push(harness.table.create_tcb(
            endpoints_for_port(port),
            7777,
            1001,
            64,
            None,
            Timestamp::ZERO,
        ));
    }
    assert_eq!(harness.table.active_count(), 50);
    assert_eq!(harness.table.timers.len(), 50);

    for port in 1000..1050u16 {
        assert!(harness.table.lookup(&endpoints_for_port(port)).is_some());
    }

    for handle in handles.iter().take(25) {
        harness
            .table
            .destroy_tcb(*handle, CloseReason::Shutdown, at(1));
    }
    assert_eq!(harness.table.active_count(), 25);
    assert_eq!(harness.table.timers.len(), 25);

    // Every connection reachable from a bucket chain is live, and the
    // reachable count matches the book-keeping.
    let mut reachable = 0;
    for bucket in 0..harness.table.buckets.len() {
        let mut cursor = harness.table.buckets[bucket];
        while let Some(index) = cursor {
            let tcb = &harness.table.slab[index as usize];
            assert!(tcb.is_active());
            reachable += 1;
            cursor = tcb.next_in_bucket;
        }
    }
    assert_eq!(reachable, 25);

    // Destroying one of them again is a logged no-op.
    harness
        .table
        .destroy_tcb(handles[0], CloseReason::Shutdown, at(2));
    assert_eq!(harness.table.active_count(), 25);

    // Freed slots are reused rather than growing the slab.
    let slab_len = harness.table.slab.len();
    for port in 2000..2025u16 {
        harness.table.create_tcb(
            endpoints_for_port(port),
            7777,
            1001,
            64,
            None,
            Timestamp::ZERO,
        );
    }
    assert_eq!(harness.table.slab.len(), slab_len);
    assert_eq!(harness.table.active_count(), 50);
}

#[test]
fn existing_tuple_is_returned_unchanged() {
    let mut harness = harness();
    let endpoints = endpoints_for_port(80);
    let first = harness
        .table
        .create_tcb(endpoints, 7777, 1001, 64, None, Timestamp::ZERO);
    let second = harness
        .table
        .create_tcb(endpoints, 9999, 2001, 64, None, at(1));
    assert_eq!(first, second);
    assert_eq!(harness.table.active_count(), 1);
    assert_eq!(harness.table.tcb(first).unwrap().seqno_me(), 7777);
}

#[test]
fn every_live_connection_keeps_exactly_one_timer() {
    let mut harness = harness();
    let handle = established(&mut harness, 80);
    assert_eq!(harness.table.timers.len(), harness.table.active_count());

    harness.table.process_timeouts(at(20));
    assert_eq!(harness.table.timers.len(), harness.table.active_count());

    harness.table.incoming_tcp(
        handle,
        TcpEvent::Data {
            seqno: 1001,
            payload: b"hi",
        },
        at(21),
    );
    assert_eq!(harness.table.timers.len(), harness.table.active_count());

    harness.table.incoming_tcp(handle, TcpEvent::Rst, at(22));
    assert_eq!(harness.table.active_count(), 0);
    assert_eq!(harness.table.timers.len(), 0);
}

#[test]
fn synack_with_bad_cookie_is_ignored() {
    let mut harness = harness();
    let endpoints = endpoints_for_port(80);
    let accepted = harness
        .table
        .accept_synack(endpoints, 1000, 0xdead_beef, 64, Timestamp::ZERO);
    assert!(accepted.is_none());
    assert_eq!(harness.table.active_count(), 0);
    assert!(harness.sink.take().is_empty());
}

#[test]
fn synack_with_valid_cookie_mints_a_connection() {
    let mut harness = harness();
    let endpoints = endpoints_for_port(80);
    let cookie = syn_cookie(&endpoints, ENTROPY);
    let handle = harness
        .table
        .accept_synack(endpoints, 1000, cookie.wrapping_add(1), 64, Timestamp::ZERO)
        .unwrap();
    let tcb = harness.table.tcb(handle).unwrap();
    assert_eq!(tcb.state(), TcpState::EstablishedRecv);
    assert_eq!(tcb.seqno_me(), cookie.wrapping_add(1));
    assert_eq!(tcb.seqno_them(), 1001);

    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].seqno, cookie.wrapping_add(1));
    assert_eq!(packets[0].ackno, 1001);
}

#[test]
fn alternate_protocol_launches_a_second_connection() {
    // A chained stream probes the target twice: the primary on the original
    // connection, the alternate from the next local port.
    let mut harness = harness();
    let chained = Arc::new(crate::protocols::ChainedStream::new(
        harness.table.registry().http_stream(),
        harness.table.registry().tls_stream(),
    ));
    harness.table.register_stream(443, chained);

    let endpoints = Endpoints::new(
        Endpoint::new("10.0.0.1".parse().unwrap(), 45000),
        Endpoint::new("1.2.3.4".parse().unwrap(), 443),
    );
    let handle = harness
        .table
        .create_tcb(endpoints, 7777, 1001, 64, None, Timestamp::ZERO);
    harness.table.incoming_tcp(
        handle,
        TcpEvent::SynAck {
            seqno: 1000,
            ackno: 7777,
        },
        Timestamp::ZERO,
    );

    assert_eq!(harness.table.active_count(), 2);
    let alt_endpoints = Endpoints::new(
        Endpoint::new("10.0.0.1".parse().unwrap(), 45001),
        endpoints.remote,
    );
    let alt = harness.table.lookup(&alt_endpoints).unwrap();
    assert_eq!(harness.table.tcb(alt).unwrap().state(), TcpState::SynSent);

    let packets = harness.sink.take_parsed();
    let syn = packets
        .iter()
        .find(|packet| packet.flags.syn())
        .expect("alternate SYN");
    assert!(!syn.flags.ack());
    assert_eq!(syn.endpoints.local, alt_endpoints.local);
    assert_eq!(syn.seqno, syn_cookie(&alt_endpoints, ENTROPY));

    // The unanswered alternate SYN is retried with growing patience.
    harness.table.process_timeouts(at(10));
    let packets = harness.sink.take_parsed();
    assert!(packets.iter().any(|packet| packet.flags.syn()));
}

#[test]
fn hello_string_parameter_overrides_the_hello() {
    let mut harness = harness();
    let encoded = BASE64.encode(b"EHLO probe\r\n");
    harness
        .table
        .set_parameter(&format!("hello-string[{}]", 3306), &encoded)
        .unwrap();

    let _handle = established(&mut harness, 3306);
    harness.table.process_timeouts(at(20));
    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].payload, b"EHLO probe\r\n");
    assert!(packets[0].flags.fin());
}

#[test]
fn forced_ssl_hello_applies_to_every_port() {
    let mut harness = harness();
    harness.table.set_parameter("hello", "ssl").unwrap();

    let _handle = established(&mut harness, 80);
    harness.table.process_timeouts(at(20));
    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    // A TLS record, not an HTTP request, and our half stays open.
    assert_eq!(packets[0].payload[0], 0x16);
    assert!(!packets[0].flags.fin());
}

#[test]
fn heartbleed_mode_shrinks_the_advertised_window() {
    let mut harness = harness();
    harness.table.set_parameter("heartbleed", "true").unwrap();

    let handle = established(&mut harness, 443);
    harness.table.process_timeouts(at(20));
    harness.sink.take();

    harness.table.incoming_tcp(
        handle,
        TcpEvent::Data {
            seqno: 1001,
            payload: &[0x16, 0x03, 0x03, 0x00, 0x02, 0x02, 0x00],
        },
        at(21),
    );
    let packets = harness.sink.take_parsed();
    let ack = packets.last().unwrap();
    assert_eq!(ack.window, 600);
}

#[test]
fn unknown_parameter_is_rejected() {
    let mut harness = harness();
    assert!(matches!(
        harness.table.set_parameter("warp-speed", "9"),
        Err(crate::config::ConfigError::UnknownParameter(_))
    ));
    assert!(harness.table.set_parameter("hello", "gopher").is_err());
    assert!(harness
        .table
        .set_parameter("hello-string[80]", "not base64 !!!")
        .is_err());
}

#[test]
fn timeout_parameters_apply() {
    let mut harness = harness();
    harness.table.set_parameter("hello-timeout", "0.5").unwrap();
    harness
        .table
        .set_parameter("connection-timeout", "5")
        .unwrap();
    assert_eq!(
        harness.table.config().hello_timeout,
        Duration::from_millis(500)
    );
    assert_eq!(
        harness.table.config().connection_timeout,
        Duration::from_secs(5)
    );

    let _handle = established(&mut harness, 80);
    // The hello now fires at half a second.
    harness.table.process_timeouts(at(6));
    let packets = harness.sink.take_parsed();
    assert_eq!(packets.len(), 1);
    assert!(packets[0].payload.starts_with(b"GET "));
}

#[test]
fn flush_all_drains_every_banner() {
    let mut harness = harness();
    for port in [80u16, 81, 82] {
        let handle = established(&mut harness, port);
        harness.table.incoming_tcp(
            handle,
            TcpEvent::Data {
                seqno: 1001,
                payload: b"greetings",
            },
            at(1),
        );
    }
    harness.sink.take();
    assert_eq!(harness.table.active_count(), 3);

    harness.table.flush_all(at(2));
    assert_eq!(harness.table.active_count(), 0);
    assert_eq!(harness.table.timers.len(), 0);
    assert_eq!(harness.reporter.take().len(), 3);
}

#[test]
fn server_first_protocol_skips_the_hello() {
    // An SSH-style server announces itself before any hello from us; the
    // hello timer must then find nothing to do.
    let mut harness = harness();
    let handle = established(&mut harness, 22);

    harness.table.incoming_tcp(
        handle,
        TcpEvent::Data {
            seqno: 1001,
            payload: b"SSH-2.0-OpenSSH_9.6\r\n",
        },
        at(1),
    );
    harness.sink.take();
    let tcb = harness.table.tcb(handle).unwrap();
    assert_eq!(tcb.app_state(), AppState::ReceiveNext);
    assert_eq!(tcb.banner().fragments()[0].protocol, "unknown");

    // The hello timer fires into ReceiveNext and is ignored; no packet
    // goes out beyond what the catch-all timer housekeeping requires.
    harness.table.process_timeouts(at(20));
    assert!(harness.sink.take().is_empty());
    assert_eq!(harness.table.timers.len(), harness.table.active_count());
}
