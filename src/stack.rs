//! The transmit-side handoff.
//!
//! The receive loop formats packets and pushes them onto a [`PacketSink`];
//! a separate transmit thread drains them onto the wire. [`ChannelSink`]
//! is the standard implementation: an MPSC channel with a bounded number of
//! in-flight packets standing in for a buffer pool. Sending never blocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no transmit buffers available")]
pub struct SinkFull;

/// Where formatted packets go. Implementations must be callable from the
/// receive thread without blocking.
pub trait PacketSink: Send + Sync {
    fn transmit(&self, packet: Vec<u8>) -> Result<(), SinkFull>;
}

/// Creates a connected sink/receiver pair with at most `budget` packets in
/// flight between the two threads.
pub fn channel(budget: usize) -> (ChannelSink, SinkReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let in_flight = Arc::new(AtomicUsize::new(0));
    (
        ChannelSink {
            tx,
            in_flight: in_flight.clone(),
            budget,
        },
        SinkReceiver { rx, in_flight },
    )
}

/// The sending half handed to the connection table.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    in_flight: Arc<AtomicUsize>,
    budget: usize,
}

impl PacketSink for ChannelSink {
    fn transmit(&self, packet: Vec<u8>) -> Result<(), SinkFull> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.budget).then_some(count + 1)
            })
            .map_err(|_| SinkFull)?;
        if self.tx.send(packet).is_err() {
            // The transmit thread is gone; give the slot back and report the
            // packet as undeliverable.
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(SinkFull);
        }
        Ok(())
    }
}

/// The draining half owned by the transmit thread.
#[derive(Debug)]
pub struct SinkReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    in_flight: Arc<AtomicUsize>,
}

impl SinkReceiver {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let packet = self.rx.recv().await?;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        Some(packet)
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        let packet = self.rx.try_recv().ok()?;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        Some(packet)
    }
}

/// Collects every transmitted packet in memory. Test double.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct VecSink {
    packets: std::sync::Mutex<Vec<Vec<u8>>>,
}

#[cfg(test)]
impl VecSink {
    pub(crate) fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.packets.lock().unwrap())
    }

    pub(crate) fn take_parsed(&self) -> Vec<crate::wire::ParsedPacket> {
        self.take()
            .iter()
            .map(|packet| crate::wire::parse(packet).expect("emitted packet must parse"))
            .collect()
    }
}

#[cfg(test)]
impl PacketSink for VecSink {
    fn transmit(&self, packet: Vec<u8>) -> Result<(), SinkFull> {
        self.packets.lock().unwrap().push(packet);
        Ok(())
    }
}
