//! Internet checksum helpers over typed 16-bit words.

/// Index of the checksum word inside an IPv4 header.
const IPV4_CSUM_WORD: usize = 5;

/// Big-endian 16-bit words of a 20 byte IPv4 header.
pub fn ipv4_header_words(header: &[u8; 20]) -> [u16; 10] {
    let mut words = [0u16; 10];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u16::from_be_bytes([header[2 * i], header[2 * i + 1]]);
    }
    words
}

pub fn sum_words(words: &[u16]) -> u64 {
    words.iter().map(|w| u64::from(*w)).sum()
}

/// Folds a ones-complement sum down to 16 bits.
pub fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Header checksum; the checksum word itself counts as zero.
pub fn ipv4_checksum(words: &[u16; 10]) -> u16 {
    let sum: u64 = words
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != IPV4_CSUM_WORD)
        .map(|(_, w)| u64::from(*w))
        .sum();
    !fold(sum)
}

/// Incremental update after one 16-bit word changed (RFC 1624, eqn. 3).
pub fn replace_word(check: u16, old: u16, new: u16) -> u16 {
    let sum = u64::from(!check) + u64::from(!old) + u64::from(new);
    !fold(sum)
}
