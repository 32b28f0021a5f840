//! Keyed sequence-number cookies.
//!
//! The engine never remembers which SYNs it has sent. Instead the initial
//! sequence number of every probe is a keyed hash of the connection's
//! 4-tuple, so a SYN-ACK can be validated statelessly by recomputing the
//! cookie from the packet itself. The same primitive, with the two endpoints
//! folded together first, drives the connection table's bucket hash.

use std::hash::Hasher;
use std::net::IpAddr;

use rustc_hash::FxHasher;

use crate::endpoint::Endpoints;

/// The per-run secret that keys every cookie. Randomized at startup so
/// remote hosts cannot predict our sequence numbers across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entropy(u64);

impl Entropy {
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Fixed seed, for reproducible runs and tests.
    pub const fn from_seed(seed: u64) -> Self {
        Self(seed)
    }
}

fn address_bits(address: IpAddr) -> u128 {
    match address {
        IpAddr::V4(ip) => u32::from(ip) as u128,
        IpAddr::V6(ip) => u128::from(ip),
    }
}

/// The SYN cookie for a connection: the initial sequence number of the probe
/// we send to `endpoints.remote`.
pub fn syn_cookie(endpoints: &Endpoints, entropy: Entropy) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(entropy.0);
    hasher.write_u128(address_bits(endpoints.local.address));
    hasher.write_u16(endpoints.local.port);
    hasher.write_u128(address_bits(endpoints.remote.address));
    hasher.write_u16(endpoints.remote.port);
    let digest = hasher.finish();
    (digest ^ (digest >> 32)) as u32
}

/// Direction-invariant digest of the 4-tuple used for bucket selection.
/// The endpoints are XOR-folded before hashing, so a packet seen from
/// either side of the connection lands in the same bucket.
pub fn symmetric_hash(endpoints: &Endpoints, entropy: Entropy) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(entropy.0);
    hasher.write_u128(
        address_bits(endpoints.local.address) ^ address_bits(endpoints.remote.address),
    );
    hasher.write_u16(endpoints.local.port ^ endpoints.remote.port);
    hasher.finish()
}
