use l4lb_common::{VipKey, MAX_REALS, MAX_VIPS};
use thiserror::Error;

/// Why a control-plane snapshot was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("ring size must be non-zero")]
    InvalidRingSize,

    #[error("real id 0 is reserved for unassigned ring slots")]
    ReservedRealId,

    #[error("real id {0} is outside the registry (max {max})", max = MAX_REALS - 1)]
    RealIdOutOfRange(u32),

    #[error("real id {0} defined twice")]
    DuplicateReal(u32),

    #[error("vip {0:?} defined twice")]
    DuplicateVip(VipKey),

    #[error("vip_num {0} is outside the vip table (max {max})", max = MAX_VIPS - 1)]
    VipNumOutOfRange(u32),

    #[error("vip_num {0} assigned to more than one vip")]
    DuplicateVipNum(u32),

    #[error("ring for vip_num {vip_num} has {got} slots, expected {expected}")]
    RingLength {
        vip_num: u32,
        expected: usize,
        got: usize,
    },

    #[error("control array has no gateway mac at index 0")]
    MissingGatewayMac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("frame of {len} bytes does not fit a {capacity} byte buffer")]
    FrameTooLarge { len: usize, capacity: usize },

    #[error("need {need} bytes of headroom, have {have}")]
    NoHeadroom { need: usize, have: usize },

    #[error("cannot move the head past the end of the frame")]
    HeadPastTail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncapError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("encapsulated frame would be {len} bytes, limit is {limit}")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("frame too short to re-derive headers")]
    Truncated,

    #[error("no gateway mac in the control array")]
    NoGateway,
}

/// Terminal drop verdicts. Each has its own counter except `Malformed`,
/// which shares the generic drop slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("malformed packet")]
    Malformed,

    #[error("ring slot unassigned")]
    RingSlotUnassigned,

    #[error("no such real")]
    RealNotFound,

    #[error("encapsulation failed")]
    EncapFailed,
}
