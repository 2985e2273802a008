//! Answers ICMP / ICMPv6 echo requests in place.

use l4lb_common::DEFAULT_TTL;
use network_types::{
    eth::EthHdr,
    ip::{Ipv4Hdr, Ipv6Hdr},
};

use crate::csum;
use crate::parse::{ICMPV6_ECHO_REPLY, ICMP_ECHOREPLY, ICMP_HDR_LEN};

const ETH_ALEN: usize = 6;

/// Swaps `len` bytes at `a` with `len` bytes at `b`; requires `a + len <= b`.
fn swap_ranges(buf: &mut [u8], a: usize, b: usize, len: usize) {
    let (left, right) = buf.split_at_mut(b);
    left[a..a + len].swap_with_slice(&mut right[..len]);
}

/// Rewrites an echo request into its reply. `None` if the frame is short.
pub fn echo_reply(frame: &mut [u8], v6: bool) -> Option<()> {
    let ip_len = if v6 { Ipv6Hdr::LEN } else { Ipv4Hdr::LEN };
    if frame.len() < EthHdr::LEN + ip_len + ICMP_HDR_LEN {
        return None;
    }
    swap_ranges(frame, 0, ETH_ALEN, ETH_ALEN);

    let ip = EthHdr::LEN;
    let icmp = ip + ip_len;
    let old_word = u16::from_be_bytes([frame[icmp], frame[icmp + 1]]);

    if v6 {
        frame[ip + 7] = DEFAULT_TTL;
        swap_ranges(frame, ip + 8, ip + 24, 16);
        frame[icmp] = ICMPV6_ECHO_REPLY;
    } else {
        frame[ip + 8] = DEFAULT_TTL;
        swap_ranges(frame, ip + 12, ip + 16, 4);
        frame[ip + 10] = 0;
        frame[ip + 11] = 0;
        let mut header = [0u8; Ipv4Hdr::LEN];
        header.copy_from_slice(&frame[ip..ip + Ipv4Hdr::LEN]);
        let check = csum::ipv4_checksum(&csum::ipv4_header_words(&header));
        frame[ip + 10..ip + 12].copy_from_slice(&check.to_be_bytes());
        frame[icmp] = ICMP_ECHOREPLY;
    }

    // Only the type changed; swapping the addresses leaves the ICMPv6
    // pseudo-header sum as it was.
    let new_word = u16::from_be_bytes([frame[icmp], frame[icmp + 1]]);
    let check = u16::from_be_bytes([frame[icmp + 2], frame[icmp + 3]]);
    let check = csum::replace_word(check, old_word, new_word);
    frame[icmp + 2..icmp + 4].copy_from_slice(&check.to_be_bytes());
    Some(())
}
