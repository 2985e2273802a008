//! Server id extraction from QUIC short-header connection ids.

use crate::parse::QUIC_HEAD_LEN;

const QUIC_LONG_HEADER: u8 = 0x80;
const CID_VERSION_MASK: u8 = 0xc0;
const CID_V1: u8 = 0x40;

/// `head` is the first bytes of the UDP payload: the header byte followed by
/// the start of the destination connection id.
///
/// Returns the server id encoded in a version 1 connection id of a short
/// header packet. Long headers and other id versions yield `None`.
pub fn server_id(head: &[u8; QUIC_HEAD_LEN]) -> Option<u32> {
    if head[0] & QUIC_LONG_HEADER != 0 {
        return None;
    }
    let cid = &head[1..];
    if cid[0] & CID_VERSION_MASK != CID_V1 {
        return None;
    }
    let id = (u32::from(cid[0] & 0x3f) << 10) | (u32::from(cid[1]) << 2) | (u32::from(cid[2]) >> 6);
    Some(id)
}
