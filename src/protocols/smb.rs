//! The SMBv1 probe stream.
//!
//! Sends a classic Negotiate Protocol request offering the NT LM 0.12
//! dialect and records the negotiate response. Response reassembly state
//! lives in the connection scratch and is dropped by the cleanup hook.

use crate::banner::{BannerOutput, BannerScratch};
use crate::payload::Payload;
use crate::protocols::ProtocolParser;
use crate::table::NetApi;

/// NetBIOS session header + SMB_COM_NEGOTIATE offering "NT LM 0.12".
const NEGOTIATE_REQUEST: &[u8] = &[
    // NetBIOS session message, length 47
    0x00, 0x00, 0x00, 0x2f, //
    // SMB header
    0xff, 0x53, 0x4d, 0x42, // "\xffSMB"
    0x72, // SMB_COM_NEGOTIATE
    0x00, 0x00, 0x00, 0x00, // status
    0x18, // flags: canonical paths, case insensitive
    0x01, 0x28, // flags2: long names, extended security
    0x00, 0x00, // PID high
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // signature
    0x00, 0x00, // reserved
    0x00, 0x00, // TID
    0xff, 0xfe, // PID low
    0x00, 0x00, // UID
    0x00, 0x00, // MID
    // parameter block
    0x00, // word count
    0x0c, 0x00, // byte count: 12
    // dialect: buffer format 0x02 + "NT LM 0.12\0"
    0x02, 0x4e, 0x54, 0x20, 0x4c, 0x4d, 0x20, 0x30, 0x2e, 0x31, 0x32, 0x00,
];

#[derive(Debug, Default)]
pub struct SmbStream;

impl ProtocolParser for SmbStream {
    fn name(&self) -> &'static str {
        "smb"
    }

    fn transmit_hello(&self, scratch: &mut BannerScratch, net: &mut NetApi) -> bool {
        net.send(Payload::borrowed(NEGOTIATE_REQUEST), false);
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
