//! Packet path of the load balancer: from a received Ethernet frame to a
//! verdict, with the frame rewritten in place when it is to be forwarded.
//!
//! A [`Lane`] processes one frame at a time against the current
//! [`LoadBalancerState`], loaded from a [`StateHandle`] per frame.

pub mod affinity;
pub mod csum;
pub mod encap;
pub mod error;
pub mod flood;
pub mod icmp;
pub mod jhash;
pub mod lane;
pub mod lpm;
pub mod lru;
pub mod packet;
pub mod parse;
pub mod quic;
pub mod ring;
pub mod state;
pub mod stats;
pub mod vip;

pub use error::{DropReason, EncapError, PacketError, StateError};
pub use lane::{Disposition, Lane, SharedDataplane};
pub use packet::PacketBuf;
pub use state::{LoadBalancerState, Settings, StateBuilder, StateHandle};
pub use stats::{LbStats, StatsSnapshot};
