//! Frame buffer with headroom, the userspace stand-in for an `xdp_buff`.

use crate::error::PacketError;

/// Bytes reserved in front of every frame, as XDP does.
pub const DEFAULT_HEADROOM: usize = 256;
pub const DEFAULT_FRAME_CAPACITY: usize = 2048;

/// One fixed allocation, reused for every frame a lane handles.
///
/// The frame lives in `buf[head..tail]`. [`PacketBuf::adjust_head`] is the
/// only way to resize it; any offset computed before a resize is stale
/// afterwards and must be derived again from [`PacketBuf::data`].
pub struct PacketBuf {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    headroom: usize,
}

impl PacketBuf {
    pub fn new(headroom: usize, frame_capacity: usize) -> Self {
        PacketBuf {
            buf: vec![0u8; headroom + frame_capacity].into_boxed_slice(),
            head: headroom,
            tail: headroom,
            headroom,
        }
    }

    /// Copies `frame` in, resetting the head to the default headroom.
    pub fn load(&mut self, frame: &[u8]) -> Result<(), PacketError> {
        let capacity = self.buf.len() - self.headroom;
        if frame.len() > capacity {
            return Err(PacketError::FrameTooLarge {
                len: frame.len(),
                capacity,
            });
        }
        self.head = self.headroom;
        self.tail = self.headroom + frame.len();
        self.buf[self.head..self.tail].copy_from_slice(frame);
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..self.tail]
    }

    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.tail == self.head
    }

    /// Free bytes in front of the frame.
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Moves the start of the frame by `delta` bytes. A negative delta grows
    /// the frame into the headroom; the new bytes are zeroed.
    pub fn adjust_head(&mut self, delta: isize) -> Result<(), PacketError> {
        if delta < 0 {
            let need = delta.unsigned_abs();
            if need > self.head {
                return Err(PacketError::NoHeadroom {
                    need,
                    have: self.head,
                });
            }
            self.head -= need;
            self.buf[self.head..self.head + need].fill(0);
        } else {
            let shrink = delta as usize;
            if self.head + shrink > self.tail {
                return Err(PacketError::HeadPastTail);
            }
            self.head += shrink;
        }
        Ok(())
    }
}

impl Default for PacketBuf {
    fn default() -> Self {
        PacketBuf::new(DEFAULT_HEADROOM, DEFAULT_FRAME_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_exposes_zeroed_bytes_in_front() {
        let mut pkt = PacketBuf::new(32, 64);
        pkt.load(&[1, 2, 3]).unwrap();
        pkt.data_mut()[0] = 9;
        pkt.adjust_head(-4).unwrap();
        assert_eq!(pkt.data(), &[0, 0, 0, 0, 9, 2, 3]);
        assert_eq!(pkt.headroom(), 28);
    }

    #[test]
    fn grow_past_headroom_is_refused_without_change() {
        let mut pkt = PacketBuf::new(8, 64);
        pkt.load(&[1, 2, 3]).unwrap();
        assert_eq!(
            pkt.adjust_head(-20),
            Err(PacketError::NoHeadroom { need: 20, have: 8 })
        );
        assert_eq!(pkt.data(), &[1, 2, 3]);
    }

    #[test]
    fn load_rejects_oversized_frames() {
        let mut pkt = PacketBuf::new(8, 4);
        assert!(pkt.load(&[0; 5]).is_err());
        pkt.load(&[0; 4]).unwrap();
        assert_eq!(pkt.len(), 4);
        assert_eq!(pkt.adjust_head(5), Err(PacketError::HeadPastTail));
        pkt.adjust_head(4).unwrap();
        assert!(pkt.is_empty());
    }
}
