//! Shared primitives and engine interfaces for the `galena` node.
//!
//! This crate holds everything the peer-logic core needs to talk about
//! without owning it: block primitives and monotonic time, the chain and
//! mempool engine interfaces, the address-store interface, and a few
//! attack-resistant collections.
#![allow(clippy::type_complexity)]
#![deny(unsafe_code)]

pub mod block;
pub mod bloom;
pub mod chain;
pub mod collections;
pub mod mempool;
pub mod network;
pub mod p2p;

pub use bitcoin;
pub use nonempty;
