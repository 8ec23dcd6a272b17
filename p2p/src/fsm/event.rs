//! State machine events.
//!
//! Events are informational outputs: the embedding node may surface them
//! to logs, RPC, or tests, but nothing in the protocol depends on them
//! being observed.
use std::fmt;

use galena_common::block::time::LocalTime;
use galena_common::block::Height;
use galena_common::p2p::PeerId;

use super::{addrmgr, syncmgr};

/// Event emitted by the state machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// The machine is initializing.
    Initializing,
    /// The machine is ready to process peers.
    Ready {
        /// Height of the active chain.
        height: Height,
        /// Local time at readiness.
        time: LocalTime,
    },
    /// A header-sync event.
    Chain(syncmgr::Event),
    /// An address-relay event.
    Address(addrmgr::Event),
    /// A peer accumulated misbehavior score.
    Misbehaved {
        /// The peer.
        peer: PeerId,
        /// Score applied now.
        score: u32,
        /// Total accumulated score.
        total: u32,
    },
    /// A peer crossed the ban threshold and was handed to the
    /// connection manager for banning.
    Banned(PeerId),
    /// Our tip looks stale; an extra outbound connection was requested.
    StaleTip(LocalTime),
}

impl From<syncmgr::Event> for Event {
    fn from(event: syncmgr::Event) -> Self {
        Self::Chain(event)
    }
}

impl From<addrmgr::Event> for Event {
    fn from(event: addrmgr::Event) -> Self {
        Self::Address(event)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Initializing => write!(fmt, "Initializing"),
            Event::Ready { height, .. } => write!(fmt, "Ready at height {}", height),
            Event::Chain(event) => event.fmt(fmt),
            Event::Address(event) => event.fmt(fmt),
            Event::Misbehaved { peer, score, total } => {
                write!(fmt, "Peer {} misbehaved (+{}, total {})", peer, score, total)
            }
            Event::Banned(peer) => write!(fmt, "Peer {} banned", peer),
            Event::StaleTip(last) => {
                write!(fmt, "Potential stale tip (last update at {})", last)
            }
        }
    }
}
